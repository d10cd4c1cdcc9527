//! In-memory LRU cache with per-entry TTL.
//!
//! Expired entries are purged lazily when they are looked up. Recency is
//! tracked with a monotonically increasing tick so eviction is O(log n).

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Cache sizing
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Maximum number of entries
    #[serde(default = "default_capacity")]
    pub capacity: usize,

    /// TTL applied when `set` is called without an override
    #[serde(default = "default_ttl_ms")]
    pub ttl_ms: u64,
}

fn default_capacity() -> usize {
    500
}
fn default_ttl_ms() -> u64 {
    60_000
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            capacity: default_capacity(),
            ttl_ms: default_ttl_ms(),
        }
    }
}

impl CacheConfig {
    pub fn new(capacity: usize, ttl_ms: u64) -> Self {
        Self { capacity, ttl_ms }
    }
}

/// Cache counters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CacheMetrics {
    pub hits: u64,
    pub misses: u64,
    pub evictions: u64,
    pub sets: u64,
    pub size: usize,
    pub capacity: usize,
    /// Hits as a fraction of lookups (0.0 when there were none)
    pub hit_rate: f64,
}

#[derive(Debug)]
struct Entry<V> {
    value: V,
    expires_at: Instant,
    tick: u64,
}

#[derive(Debug)]
struct CacheInner<V> {
    entries: HashMap<String, Entry<V>>,
    /// tick -> key, oldest first
    recency: BTreeMap<u64, String>,
    tick: u64,
    hits: u64,
    misses: u64,
    evictions: u64,
    sets: u64,
}

impl<V> CacheInner<V> {
    fn touch(&mut self, key: &str) {
        self.tick += 1;
        let tick = self.tick;
        if let Some(entry) = self.entries.get_mut(key) {
            self.recency.remove(&entry.tick);
            entry.tick = tick;
            self.recency.insert(tick, key.to_string());
        }
    }

    fn remove(&mut self, key: &str) -> Option<Entry<V>> {
        let entry = self.entries.remove(key)?;
        self.recency.remove(&entry.tick);
        Some(entry)
    }

    fn evict_oldest(&mut self) {
        if let Some((_, key)) = self.recency.pop_first() {
            self.entries.remove(&key);
            self.evictions += 1;
        }
    }
}

/// LRU + TTL cache
#[derive(Debug)]
pub struct Cache<V> {
    config: CacheConfig,
    inner: Mutex<CacheInner<V>>,
}

impl<V: Clone> Cache<V> {
    pub fn new(config: CacheConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                recency: BTreeMap::new(),
                tick: 0,
                hits: 0,
                misses: 0,
                evictions: 0,
                sets: 0,
            }),
        }
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Look up a live entry, refreshing its recency
    pub fn get(&self, key: &str) -> Option<V> {
        let mut inner = self.inner.lock();

        let now = Instant::now();
        let Some(expired) = inner.entries.get(key).map(|e| e.expires_at <= now) else {
            inner.misses += 1;
            return None;
        };

        if expired {
            inner.remove(key);
            inner.misses += 1;
            return None;
        }

        inner.hits += 1;
        inner.touch(key);
        inner.entries.get(key).map(|e| e.value.clone())
    }

    /// Insert or replace an entry. `ttl` overrides the configured default.
    pub fn set(&self, key: impl Into<String>, value: V, ttl: Option<Duration>) {
        if self.config.capacity == 0 {
            return;
        }

        let key = key.into();
        let ttl = ttl.unwrap_or(Duration::from_millis(self.config.ttl_ms));
        let mut inner = self.inner.lock();

        inner.remove(&key);
        if inner.entries.len() >= self.config.capacity {
            inner.evict_oldest();
        }

        inner.tick += 1;
        let tick = inner.tick;
        inner.recency.insert(tick, key.clone());
        inner.entries.insert(
            key,
            Entry {
                value,
                expires_at: Instant::now() + ttl,
                tick,
            },
        );
        inner.sets += 1;
    }

    /// Return the cached value or produce, store and return a fresh one
    pub async fn get_or_set<F, Fut>(&self, key: &str, producer: F, ttl: Option<Duration>) -> V
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = V>,
    {
        if let Some(value) = self.get(key) {
            return value;
        }
        let value = producer().await;
        self.set(key, value.clone(), ttl);
        value
    }

    /// Like `get_or_set` for fallible producers. Errors are returned and
    /// never cached.
    pub async fn get_or_try_set<F, Fut, E>(
        &self,
        key: &str,
        producer: F,
        ttl: Option<Duration>,
    ) -> Result<V, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V, E>>,
    {
        if let Some(value) = self.get(key) {
            return Ok(value);
        }
        let value = producer().await?;
        self.set(key, value.clone(), ttl);
        Ok(value)
    }

    /// Remove one entry. Returns true if it was present.
    pub fn invalidate(&self, key: &str) -> bool {
        self.inner.lock().remove(key).is_some()
    }

    /// Remove every entry whose key starts with `prefix`; returns the count
    pub fn invalidate_prefix(&self, prefix: &str) -> usize {
        let mut inner = self.inner.lock();
        let keys: Vec<String> = inner
            .entries
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect();
        for key in &keys {
            inner.remove(key);
        }
        keys.len()
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.recency.clear();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn metrics(&self) -> CacheMetrics {
        let inner = self.inner.lock();
        let lookups = inner.hits + inner.misses;
        CacheMetrics {
            hits: inner.hits,
            misses: inner.misses,
            evictions: inner.evictions,
            sets: inner.sets,
            size: inner.entries.len(),
            capacity: self.config.capacity,
            hit_rate: if lookups > 0 {
                inner.hits as f64 / lookups as f64
            } else {
                0.0
            },
        }
    }
}

/// Sizing for the well-known named caches
pub fn builtin_caches() -> BTreeMap<String, CacheConfig> {
    [
        ("conductor", CacheConfig::new(200, 5_000)),
        ("registry", CacheConfig::new(100, 30_000)),
        ("patterns", CacheConfig::new(300, 120_000)),
        ("ai", CacheConfig::new(50, 10_000)),
        ("health", CacheConfig::new(50, 15_000)),
    ]
    .into_iter()
    .map(|(name, config)| (name.to_string(), config))
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_lru_eviction_order() {
        let cache = Cache::new(CacheConfig::new(2, 60_000));
        cache.set("a", 1, None);
        cache.set("b", 2, None);

        // Touch "a" so "b" becomes the oldest
        assert_eq!(cache.get("a"), Some(1));
        cache.set("c", 3, None);

        assert_eq!(cache.get("b"), None);
        assert_eq!(cache.get("a"), Some(1));
        assert_eq!(cache.get("c"), Some(3));
        assert_eq!(cache.metrics().evictions, 1);
    }

    #[test]
    fn test_replacing_key_does_not_evict() {
        let cache = Cache::new(CacheConfig::new(2, 60_000));
        cache.set("a", 1, None);
        cache.set("b", 2, None);
        cache.set("a", 10, None);

        assert_eq!(cache.len(), 2);
        assert_eq!(cache.get("b"), Some(2));
        assert_eq!(cache.metrics().evictions, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_ttl_expiry_and_override() {
        let cache = Cache::new(CacheConfig::new(10, 1_000));
        cache.set("short", 1, None);
        cache.set("long", 2, Some(Duration::from_secs(10)));

        tokio::time::advance(Duration::from_millis(1_001)).await;

        assert_eq!(cache.get("short"), None);
        assert_eq!(cache.get("long"), Some(2));
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_get_or_try_set_skips_errors() {
        let cache: Cache<String> = Cache::new(CacheConfig::default());
        let calls = AtomicU32::new(0);

        let failed: Result<String, &str> = cache
            .get_or_try_set(
                "k",
                || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Err("boom")
                },
                None,
            )
            .await;
        assert!(failed.is_err());
        assert!(cache.is_empty());

        for _ in 0..2 {
            let value: Result<String, &str> = cache
                .get_or_try_set(
                    "k",
                    || async {
                        calls.fetch_add(1, Ordering::SeqCst);
                        Ok("v".to_string())
                    },
                    None,
                )
                .await;
            assert_eq!(value.unwrap(), "v");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 2);
    }

    #[test]
    fn test_invalidate_prefix() {
        let cache = Cache::new(CacheConfig::default());
        cache.set("agent:a:1", 1, None);
        cache.set("agent:a:2", 2, None);
        cache.set("agent:b:1", 3, None);

        assert_eq!(cache.invalidate_prefix("agent:a:"), 2);
        assert!(cache.invalidate("agent:b:1"));
        assert!(!cache.invalidate("agent:b:1"));
        assert!(cache.is_empty());
    }

    #[test]
    fn test_hit_rate() {
        let cache = Cache::new(CacheConfig::default());
        cache.set("a", 1, None);
        cache.get("a");
        cache.get("missing");

        let metrics = cache.metrics();
        assert_eq!(metrics.hits, 1);
        assert_eq!(metrics.misses, 1);
        assert_eq!(metrics.hit_rate, 0.5);
    }
}
