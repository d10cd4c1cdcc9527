//! Resilience primitives shared by the executor and the HTTP surface.
//!
//! - CircuitBreaker: per-target failure isolation
//! - Cache: LRU + TTL response cache
//! - ConnectionPool: bounded concurrency with a FIFO queue
//! - RateLimiter: fixed-window ingress throttling
//! - Retry: classified retries with backoff profiles
//!
//! `Resilience` owns one named instance of each and is built once per
//! process from `ResilienceConfig`.

pub mod cache;
pub mod circuit_breaker;
pub mod pool;
pub mod rate_limiter;
pub mod retry;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

pub use cache::{Cache, CacheConfig, CacheMetrics};
pub use circuit_breaker::{
    BreakerConfig, BreakerRegistry, BreakerState, BreakerStatus, BreakerTransition,
    CircuitBreaker, CircuitOpenError, TransitionListener,
};
pub use pool::{ConnectionPool, PoolConfig, PoolError, PoolStatus, PoolTicket};
pub use rate_limiter::{RateDecision, RateLimitConfig, RateLimiter, RateLimiterMetrics};
pub use retry::{classify_message, retry, Backoff, BackoffStrategy, Classify, ErrorClass, RetryPolicy};

/// Resilience section of the config file. Named entries are merged over
/// the built-in defaults.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResilienceConfig {
    /// Defaults for breakers without an override
    #[serde(default)]
    pub breaker: BreakerConfig,

    /// Per-target breaker overrides
    #[serde(default)]
    pub breakers: HashMap<String, BreakerConfig>,

    /// Config for caches created on demand
    #[serde(default)]
    pub default_cache: CacheConfig,

    #[serde(default)]
    pub caches: BTreeMap<String, CacheConfig>,

    /// Config for pools created on demand
    #[serde(default)]
    pub default_pool: PoolConfig,

    #[serde(default)]
    pub pools: BTreeMap<String, PoolConfig>,

    #[serde(default)]
    pub rate_limits: BTreeMap<String, RateLimitConfig>,
}

/// Aggregates across every primitive
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResilienceSummary {
    pub breakers_registered: usize,
    pub breakers_open: usize,
    /// Hits over lookups across all caches; `None` before any lookup
    pub total_cache_hit_rate: Option<f64>,
    pub pools_active: usize,
    pub rate_limiter_clients: usize,
}

/// Snapshot served by the status endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResilienceStatus {
    pub timestamp: DateTime<Utc>,
    pub circuit_breakers: BTreeMap<String, BreakerStatus>,
    pub caches: BTreeMap<String, CacheMetrics>,
    pub pools: BTreeMap<String, PoolStatus>,
    pub rate_limiters: BTreeMap<String, RateLimiterMetrics>,
    pub summary: ResilienceSummary,
}

/// Named breakers, caches, pools and limiters
pub struct Resilience {
    breakers: BreakerRegistry,
    default_cache: CacheConfig,
    caches: RwLock<BTreeMap<String, Arc<Cache<serde_json::Value>>>>,
    default_pool: PoolConfig,
    pools: RwLock<BTreeMap<String, Arc<ConnectionPool>>>,
    limiters: BTreeMap<String, Arc<RateLimiter>>,
}

impl Resilience {
    pub fn new(config: &ResilienceConfig) -> Self {
        Self::build(config, None)
    }

    /// Build with a listener that observes every breaker transition
    pub fn with_listener(config: &ResilienceConfig, listener: TransitionListener) -> Self {
        Self::build(config, Some(listener))
    }

    fn build(config: &ResilienceConfig, listener: Option<TransitionListener>) -> Self {
        let mut breakers = BreakerRegistry::new(config.breaker.clone(), config.breakers.clone());
        if let Some(listener) = listener {
            breakers = breakers.with_listener(listener);
        }

        let mut cache_configs = cache::builtin_caches();
        cache_configs.extend(config.caches.clone());
        let caches: BTreeMap<String, Arc<Cache<serde_json::Value>>> = cache_configs
            .into_iter()
            .map(|(name, c)| (name, Arc::new(Cache::new(c))))
            .collect();

        let mut pool_configs = pool::builtin_pools();
        pool_configs.extend(config.pools.clone());
        let pools: BTreeMap<String, Arc<ConnectionPool>> = pool_configs
            .into_iter()
            .map(|(name, c)| {
                let pool = Arc::new(ConnectionPool::new(name.clone(), c));
                (name, pool)
            })
            .collect();

        let mut tiers = rate_limiter::builtin_tiers();
        tiers.extend(config.rate_limits.clone());
        let limiters: BTreeMap<String, Arc<RateLimiter>> = tiers
            .into_iter()
            .map(|(name, c)| (name, Arc::new(RateLimiter::new(c))))
            .collect();

        Self {
            breakers,
            default_cache: config.default_cache.clone(),
            caches: RwLock::new(caches),
            default_pool: config.default_pool.clone(),
            pools: RwLock::new(pools),
            limiters,
        }
    }

    /// Breaker for a target, created on first use
    pub fn breaker(&self, name: &str) -> Arc<CircuitBreaker> {
        self.breakers.get(name)
    }

    pub fn breakers(&self) -> &BreakerRegistry {
        &self.breakers
    }

    /// Manually close a breaker. Returns false if no such breaker exists.
    pub fn reset_breaker(&self, name: &str) -> bool {
        self.breakers.reset(name)
    }

    /// Named cache, created with the default config on first use
    pub fn cache(&self, name: &str) -> Arc<Cache<serde_json::Value>> {
        if let Some(cache) = self.caches.read().get(name) {
            return cache.clone();
        }
        self.caches
            .write()
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(Cache::new(self.default_cache.clone())))
            .clone()
    }

    /// Named pool, created with the default config on first use
    pub fn pool(&self, name: &str) -> Arc<ConnectionPool> {
        if let Some(pool) = self.pools.read().get(name) {
            return pool.clone();
        }
        self.pools
            .write()
            .entry(name.to_string())
            .or_insert_with(|| Arc::new(ConnectionPool::new(name, self.default_pool.clone())))
            .clone()
    }

    /// Limiter for a tier; tiers are fixed at construction
    pub fn limiter(&self, tier: &str) -> Option<Arc<RateLimiter>> {
        self.limiters.get(tier).cloned()
    }

    /// Drop stale limiter windows across all tiers
    pub fn cleanup_limiters(&self) -> usize {
        self.limiters.values().map(|l| l.cleanup()).sum()
    }

    pub fn status(&self) -> ResilienceStatus {
        let circuit_breakers = self.breakers.statuses();
        let caches: BTreeMap<String, CacheMetrics> = self
            .caches
            .read()
            .iter()
            .map(|(name, c)| (name.clone(), c.metrics()))
            .collect();
        let pools: BTreeMap<String, PoolStatus> = self
            .pools
            .read()
            .iter()
            .map(|(name, p)| (name.clone(), p.status()))
            .collect();
        let rate_limiters: BTreeMap<String, RateLimiterMetrics> = self
            .limiters
            .iter()
            .map(|(name, l)| (name.clone(), l.metrics()))
            .collect();

        let (hits, misses) = caches
            .values()
            .fold((0u64, 0u64), |(h, m), c| (h + c.hits, m + c.misses));

        let summary = ResilienceSummary {
            breakers_registered: circuit_breakers.len(),
            breakers_open: circuit_breakers
                .values()
                .filter(|b| b.state == BreakerState::Open)
                .count(),
            total_cache_hit_rate: if hits + misses > 0 {
                Some(hits as f64 / (hits + misses) as f64)
            } else {
                None
            },
            pools_active: pools.values().map(|p| p.active).sum(),
            rate_limiter_clients: rate_limiters.values().map(|l| l.tracked_clients).sum(),
        };

        ResilienceStatus {
            timestamp: Utc::now(),
            circuit_breakers,
            caches,
            pools,
            rate_limiters,
            summary,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_instances() {
        let resilience = Resilience::new(&ResilienceConfig::default());
        let status = resilience.status();

        assert_eq!(status.caches.len(), 5);
        assert_eq!(status.caches["ai"].capacity, 50);
        assert_eq!(status.pools["ai"].max_concurrent, 6);
        assert_eq!(status.pools["edge"].timeout_ms, 5_000);
        assert_eq!(status.rate_limiters["auth"].window_ms, 300_000);
        assert_eq!(status.summary.total_cache_hit_rate, None);
    }

    #[test]
    fn test_config_overrides_merge() {
        let mut config = ResilienceConfig::default();
        config.pools.insert("ai".to_string(), PoolConfig::new(2, 4, 1_000));
        config
            .rate_limits
            .insert("partner".to_string(), RateLimitConfig::new(1_000, 5));

        let resilience = Resilience::new(&config);
        assert_eq!(resilience.pool("ai").config().max_concurrent, 2);
        assert_eq!(resilience.pool("cloud").config().max_concurrent, 8);
        assert!(resilience.limiter("partner").is_some());
        assert!(resilience.limiter("missing").is_none());

        // Unknown pools are created from the default config
        assert_eq!(resilience.pool("scratch").config().max_concurrent, 10);
    }

    #[tokio::test]
    async fn test_summary_counts_open_breakers() {
        let mut config = ResilienceConfig::default();
        config.breaker.failure_threshold = 1;
        let resilience = Resilience::new(&config);

        let breaker = resilience.breaker("agent-a");
        let _: Result<(), CircuitOpenError> = breaker
            .execute(|| async {
                Err(CircuitOpenError {
                    name: "x".to_string(),
                    retry_after: std::time::Duration::ZERO,
                })
            })
            .await;
        resilience.breaker("agent-b");

        let summary = resilience.status().summary;
        assert_eq!(summary.breakers_registered, 2);
        assert_eq!(summary.breakers_open, 1);

        assert!(resilience.reset_breaker("agent-a"));
        assert_eq!(resilience.status().summary.breakers_open, 0);
    }
}
