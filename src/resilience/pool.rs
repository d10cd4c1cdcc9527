//! Bounded-concurrency pool with a FIFO wait queue.
//!
//! Backed by a fair tokio semaphore: waiters are served in arrival order,
//! and a released permit goes straight to the oldest waiter.

use std::collections::BTreeMap;
use std::future::Future;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Semaphore, SemaphorePermit};
use tracing::debug;

/// Pool limits
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,

    /// Callers allowed to wait once all slots are busy
    #[serde(default = "default_queue_limit")]
    pub queue_limit: usize,

    /// How long a queued caller waits for a slot
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_max_concurrent() -> usize {
    10
}
fn default_queue_limit() -> usize {
    50
}
fn default_timeout_ms() -> u64 {
    30_000
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_concurrent: default_max_concurrent(),
            queue_limit: default_queue_limit(),
            timeout_ms: default_timeout_ms(),
        }
    }
}

impl PoolConfig {
    pub fn new(max_concurrent: usize, queue_limit: usize, timeout_ms: u64) -> Self {
        Self {
            max_concurrent,
            queue_limit,
            timeout_ms,
        }
    }
}

/// Why a pool refused to run a call
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum PoolError {
    #[error("Pool '{pool}' exhausted: {active} active, {queued} queued")]
    Exhausted {
        pool: String,
        active: usize,
        queued: usize,
    },

    #[error("Pool '{pool}' queue timeout after {timeout_ms}ms")]
    Timeout { pool: String, timeout_ms: u64 },
}

/// Pool counters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PoolMetrics {
    pub acquired: u64,
    pub released: u64,
    pub queued: u64,
    pub timeouts: u64,
    pub rejected: u64,
}

/// Point-in-time snapshot of a pool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolStatus {
    pub name: String,
    pub active: usize,
    pub queued: usize,
    pub max_concurrent: usize,
    pub queue_limit: usize,
    pub timeout_ms: u64,
    pub metrics: PoolMetrics,
    /// Active slots as a percentage of `max_concurrent`
    pub utilization: f64,
}

#[derive(Debug, Default)]
struct PoolCounters {
    queued: usize,
    metrics: PoolMetrics,
}

/// Named bounded-concurrency pool
#[derive(Debug)]
pub struct ConnectionPool {
    name: String,
    config: PoolConfig,
    slots: Semaphore,
    counters: Mutex<PoolCounters>,
}

/// A held pool slot; released on drop
#[derive(Debug)]
pub struct PoolTicket<'a> {
    pool: &'a ConnectionPool,
    _permit: SemaphorePermit<'a>,
}

impl Drop for PoolTicket<'_> {
    fn drop(&mut self) {
        self.pool.counters.lock().metrics.released += 1;
    }
}

/// Keeps the queued count honest if the waiting future is dropped
struct QueueSlot<'a>(&'a ConnectionPool);

impl Drop for QueueSlot<'_> {
    fn drop(&mut self) {
        let mut counters = self.0.counters.lock();
        counters.queued = counters.queued.saturating_sub(1);
    }
}

impl ConnectionPool {
    pub fn new(name: impl Into<String>, config: PoolConfig) -> Self {
        Self {
            name: name.into(),
            slots: Semaphore::new(config.max_concurrent),
            config,
            counters: Mutex::new(PoolCounters::default()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &PoolConfig {
        &self.config
    }

    /// Number of slots currently held
    pub fn active(&self) -> usize {
        self.config
            .max_concurrent
            .saturating_sub(self.slots.available_permits())
    }

    /// Run `f` once a slot is free
    pub async fn execute<F, Fut, T, E>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<PoolError>,
    {
        let _ticket = self.acquire().await?;
        f().await
    }

    /// Acquire a slot, queueing up to the configured limit and timeout
    pub async fn acquire(&self) -> Result<PoolTicket<'_>, PoolError> {
        if let Ok(permit) = self.slots.try_acquire() {
            self.counters.lock().metrics.acquired += 1;
            return Ok(self.ticket(permit));
        }

        {
            let mut counters = self.counters.lock();
            if counters.queued >= self.config.queue_limit {
                counters.metrics.rejected += 1;
                return Err(PoolError::Exhausted {
                    pool: self.name.clone(),
                    active: self.active(),
                    queued: counters.queued,
                });
            }
            counters.queued += 1;
            counters.metrics.queued += 1;
        }

        let _slot = QueueSlot(self);
        debug!(pool = %self.name, "Waiting for pool slot");

        let timeout = Duration::from_millis(self.config.timeout_ms);
        match tokio::time::timeout(timeout, self.slots.acquire()).await {
            Ok(Ok(permit)) => {
                self.counters.lock().metrics.acquired += 1;
                Ok(self.ticket(permit))
            }
            // The semaphore is never closed; treat it like a full queue
            Ok(Err(_)) => Err(PoolError::Exhausted {
                pool: self.name.clone(),
                active: self.active(),
                queued: self.counters.lock().queued,
            }),
            Err(_) => {
                self.counters.lock().metrics.timeouts += 1;
                Err(PoolError::Timeout {
                    pool: self.name.clone(),
                    timeout_ms: self.config.timeout_ms,
                })
            }
        }
    }

    pub fn status(&self) -> PoolStatus {
        let active = self.active();
        let counters = self.counters.lock();
        PoolStatus {
            name: self.name.clone(),
            active,
            queued: counters.queued,
            max_concurrent: self.config.max_concurrent,
            queue_limit: self.config.queue_limit,
            timeout_ms: self.config.timeout_ms,
            metrics: counters.metrics.clone(),
            utilization: if self.config.max_concurrent > 0 {
                active as f64 / self.config.max_concurrent as f64 * 100.0
            } else {
                0.0
            },
        }
    }

    fn ticket<'a>(&'a self, permit: SemaphorePermit<'a>) -> PoolTicket<'a> {
        PoolTicket {
            pool: self,
            _permit: permit,
        }
    }
}

/// Limits for the well-known named pools
pub fn builtin_pools() -> BTreeMap<String, PoolConfig> {
    [
        ("cloud", PoolConfig::new(8, 30, 30_000)),
        ("file", PoolConfig::new(20, 100, 10_000)),
        ("ai", PoolConfig::new(6, 20, 60_000)),
        ("edge", PoolConfig::new(15, 50, 5_000)),
        ("database", PoolConfig::new(10, 40, 15_000)),
    ]
    .into_iter()
    .map(|(name, config)| (name.to_string(), config))
    .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_runs_immediately_with_free_slot() {
        let pool = ConnectionPool::new("p", PoolConfig::new(1, 0, 100));
        let value: Result<u32, PoolError> = pool.execute(|| async { Ok(7) }).await;

        assert_eq!(value, Ok(7));
        let status = pool.status();
        assert_eq!(status.active, 0);
        assert_eq!(status.metrics.acquired, 1);
        assert_eq!(status.metrics.released, 1);
    }

    #[tokio::test]
    async fn test_zero_queue_rejects_when_busy() {
        let pool = ConnectionPool::new("p", PoolConfig::new(1, 0, 100));
        let _held = pool.acquire().await.unwrap();

        let err = pool.acquire().await.unwrap_err();
        assert!(matches!(err, PoolError::Exhausted { active: 1, queued: 0, .. }));
        assert_eq!(pool.status().metrics.rejected, 1);
        assert_eq!(pool.status().utilization, 100.0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_dropped_waiter_frees_queue_slot() {
        let pool = Arc::new(ConnectionPool::new("p", PoolConfig::new(1, 1, 60_000)));
        let _held = pool.acquire().await.unwrap();

        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move {
                let _ticket = pool.acquire().await;
            })
        };
        tokio::task::yield_now().await;
        assert_eq!(pool.status().queued, 1);

        waiter.abort();
        let _ = waiter.await;
        assert_eq!(pool.status().queued, 0);
    }
}
