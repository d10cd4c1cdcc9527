//! Fixed-window rate limiting per caller key.

use std::collections::{BTreeMap, HashMap};
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Window size and quota
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_window_ms")]
    pub window_ms: u64,

    #[serde(default = "default_max_requests")]
    pub max_requests: u32,
}

fn default_window_ms() -> u64 {
    60_000
}
fn default_max_requests() -> u32 {
    100
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window_ms: default_window_ms(),
            max_requests: default_max_requests(),
        }
    }
}

impl RateLimitConfig {
    pub fn new(window_ms: u64, max_requests: u32) -> Self {
        Self {
            window_ms,
            max_requests,
        }
    }

    pub fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

/// Result of counting one request against a key's window
#[derive(Debug, Clone, PartialEq)]
pub enum RateDecision {
    Allowed {
        limit: u32,
        remaining: u32,
        reset_at: DateTime<Utc>,
    },
    Throttled {
        limit: u32,
        remaining: u32,
        reset_at: DateTime<Utc>,
        retry_after_ms: u64,
        window_ms: u64,
    },
}

impl RateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateDecision::Allowed { .. })
    }

    pub fn limit(&self) -> u32 {
        match self {
            RateDecision::Allowed { limit, .. } | RateDecision::Throttled { limit, .. } => *limit,
        }
    }

    pub fn remaining(&self) -> u32 {
        match self {
            RateDecision::Allowed { remaining, .. } | RateDecision::Throttled { remaining, .. } => {
                *remaining
            }
        }
    }

    pub fn reset_at(&self) -> DateTime<Utc> {
        match self {
            RateDecision::Allowed { reset_at, .. } | RateDecision::Throttled { reset_at, .. } => {
                *reset_at
            }
        }
    }
}

/// Limiter snapshot
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimiterMetrics {
    pub window_ms: u64,
    pub max_requests: u32,
    pub tracked_clients: usize,
    pub allowed: u64,
    pub throttled: u64,
}

#[derive(Debug, Clone, Copy)]
struct Window {
    started: Instant,
    started_at: DateTime<Utc>,
    count: u32,
}

#[derive(Debug, Default)]
struct LimiterInner {
    windows: HashMap<String, Window>,
    allowed: u64,
    throttled: u64,
}

/// Fixed-window counter keyed by caller
#[derive(Debug)]
pub struct RateLimiter {
    config: RateLimitConfig,
    inner: Mutex<LimiterInner>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            inner: Mutex::new(LimiterInner::default()),
        }
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    /// Count one request for `key` and decide whether it may proceed
    pub fn check(&self, key: &str) -> RateDecision {
        let window = self.config.window();
        let now = Instant::now();
        let mut inner = self.inner.lock();

        let entry = inner
            .windows
            .entry(key.to_string())
            .and_modify(|w| {
                if now.duration_since(w.started) > window {
                    *w = Window {
                        started: now,
                        started_at: Utc::now(),
                        count: 0,
                    };
                }
            })
            .or_insert_with(|| Window {
                started: now,
                started_at: Utc::now(),
                count: 0,
            });
        entry.count = entry.count.saturating_add(1);
        let current = *entry;

        let limit = self.config.max_requests;
        let remaining = limit.saturating_sub(current.count);
        let reset_at = current.started_at
            + chrono::Duration::milliseconds(self.config.window_ms as i64);

        if current.count > limit {
            inner.throttled += 1;
            let elapsed = now.duration_since(current.started);
            RateDecision::Throttled {
                limit,
                remaining,
                reset_at,
                retry_after_ms: window.saturating_sub(elapsed).as_millis() as u64,
                window_ms: self.config.window_ms,
            }
        } else {
            inner.allowed += 1;
            RateDecision::Allowed {
                limit,
                remaining,
                reset_at,
            }
        }
    }

    /// Drop windows older than twice the window length; returns the count
    pub fn cleanup(&self) -> usize {
        let stale_after = self.config.window() * 2;
        let now = Instant::now();
        let mut inner = self.inner.lock();
        let before = inner.windows.len();
        inner
            .windows
            .retain(|_, w| now.duration_since(w.started) <= stale_after);
        before - inner.windows.len()
    }

    pub fn metrics(&self) -> RateLimiterMetrics {
        let inner = self.inner.lock();
        RateLimiterMetrics {
            window_ms: self.config.window_ms,
            max_requests: self.config.max_requests,
            tracked_clients: inner.windows.len(),
            allowed: inner.allowed,
            throttled: inner.throttled,
        }
    }
}

/// Quotas for the well-known limiter tiers
pub fn builtin_tiers() -> BTreeMap<String, RateLimitConfig> {
    [
        ("api", RateLimitConfig::new(60_000, 100)),
        ("ai", RateLimitConfig::new(60_000, 20)),
        ("auth", RateLimitConfig::new(300_000, 10)),
        ("public", RateLimitConfig::new(60_000, 200)),
        ("webhook", RateLimitConfig::new(60_000, 50)),
    ]
    .into_iter()
    .map(|(name, config)| (name.to_string(), config))
    .collect()
}
