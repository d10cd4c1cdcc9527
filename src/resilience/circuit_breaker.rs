//! Per-target circuit breaker.
//!
//! States: CLOSED (normal) -> OPEN (failing) -> HALF_OPEN (probing recovery).
//! Successes while CLOSED decay the failure counter by one instead of
//! clearing it, so a single flaky call looks different from an outage.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{info, warn};

/// Breaker state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BreakerState {
    Closed,
    Open,
    HalfOpen,
}

impl std::fmt::Display for BreakerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BreakerState::Closed => "CLOSED",
            BreakerState::Open => "OPEN",
            BreakerState::HalfOpen => "HALF_OPEN",
        };
        f.pad(s)
    }
}

/// Breaker tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerConfig {
    /// Failures (net of decay) that trip the breaker
    #[serde(default = "default_failure_threshold")]
    pub failure_threshold: u32,

    /// How long the breaker stays OPEN before allowing probes
    #[serde(default = "default_reset_timeout_ms")]
    pub reset_timeout_ms: u64,

    /// Probe successes needed to close again; also the probe budget
    #[serde(default = "default_half_open_max_calls")]
    pub half_open_max_calls: u32,
}

fn default_failure_threshold() -> u32 {
    5
}
fn default_reset_timeout_ms() -> u64 {
    30_000
}
fn default_half_open_max_calls() -> u32 {
    3
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: default_failure_threshold(),
            reset_timeout_ms: default_reset_timeout_ms(),
            half_open_max_calls: default_half_open_max_calls(),
        }
    }
}

impl BreakerConfig {
    pub fn reset_timeout(&self) -> Duration {
        Duration::from_millis(self.reset_timeout_ms)
    }
}

/// Returned instead of calling the wrapped function while the breaker is open
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("Circuit '{name}' is OPEN, retry after {}ms", retry_after.as_millis())]
pub struct CircuitOpenError {
    pub name: String,
    pub retry_after: Duration,
}

/// A state change, published to telemetry consumers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerTransition {
    pub breaker: String,
    pub from: BreakerState,
    pub to: BreakerState,
    pub timestamp: DateTime<Utc>,
}

/// Callback invoked for every breaker transition
pub type TransitionListener = Arc<dyn Fn(&BreakerTransition) + Send + Sync>;

/// Lifetime counters
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BreakerMetrics {
    pub total_calls: u64,
    pub total_failures: u64,
    pub total_successes: u64,
    pub trips: u64,
}

/// Point-in-time snapshot of a breaker
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerStatus {
    pub name: String,
    pub state: BreakerState,
    pub failure_count: u32,
    pub success_count: u32,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub last_transition_at: DateTime<Utc>,
    pub metrics: BreakerMetrics,
}

#[derive(Debug)]
struct BreakerInner {
    state: BreakerState,
    failures: u32,
    successes: u32,
    half_open_calls: u32,
    opened_at: Option<Instant>,
    last_failure_at: Option<DateTime<Utc>>,
    last_transition_at: DateTime<Utc>,
    metrics: BreakerMetrics,
}

/// Failure-isolation state machine for one named target
pub struct CircuitBreaker {
    name: String,
    config: BreakerConfig,
    inner: Mutex<BreakerInner>,
    listener: Option<TransitionListener>,
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field("config", &self.config)
            .field("state", &self.state())
            .finish()
    }
}

impl CircuitBreaker {
    /// Create a closed breaker
    pub fn new(name: impl Into<String>, config: BreakerConfig) -> Self {
        Self {
            name: name.into(),
            config,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                failures: 0,
                successes: 0,
                half_open_calls: 0,
                opened_at: None,
                last_failure_at: None,
                last_transition_at: Utc::now(),
                metrics: BreakerMetrics::default(),
            }),
            listener: None,
        }
    }

    /// Attach a transition listener
    pub fn with_listener(mut self, listener: TransitionListener) -> Self {
        self.listener = Some(listener);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &BreakerConfig {
        &self.config
    }

    pub fn state(&self) -> BreakerState {
        self.inner.lock().state
    }

    /// Run `f` through the breaker
    pub async fn execute<F, Fut, T, E>(&self, f: F) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: From<CircuitOpenError>,
    {
        self.admit()?;

        match f().await {
            Ok(value) => {
                self.on_success();
                Ok(value)
            }
            Err(e) => {
                self.on_failure();
                Err(e)
            }
        }
    }

    /// Run `f` through the breaker, serving `fallback` instead of failing
    /// while the circuit is open
    pub async fn execute_with_fallback<F, Fut, G, GFut, T, E>(&self, f: F, fallback: G) -> Result<T, E>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        G: FnOnce(CircuitOpenError) -> GFut,
        GFut: Future<Output = Result<T, E>>,
    {
        if let Err(open) = self.admit() {
            return fallback(open).await;
        }

        match f().await {
            Ok(value) => {
                self.on_success();
                Ok(value)
            }
            Err(e) => {
                self.on_failure();
                if self.state() == BreakerState::Open {
                    return fallback(self.open_error(self.config.reset_timeout())).await;
                }
                Err(e)
            }
        }
    }

    /// Force the breaker back to CLOSED (operator action)
    pub fn reset(&self) {
        let transition = {
            let mut inner = self.inner.lock();
            let transition = if inner.state != BreakerState::Closed {
                Some(self.transition(&mut inner, BreakerState::Closed))
            } else {
                None
            };
            inner.failures = 0;
            inner.successes = 0;
            inner.half_open_calls = 0;
            inner.opened_at = None;
            transition
        };

        info!(breaker = %self.name, "Circuit breaker manually reset");
        if let Some(transition) = transition {
            self.notify(&transition);
        }
    }

    /// Snapshot of the breaker's state and counters
    pub fn status(&self) -> BreakerStatus {
        let inner = self.inner.lock();
        BreakerStatus {
            name: self.name.clone(),
            state: inner.state,
            failure_count: inner.failures,
            success_count: inner.successes,
            last_failure_at: inner.last_failure_at,
            last_transition_at: inner.last_transition_at,
            metrics: inner.metrics.clone(),
        }
    }

    /// Decide whether a call may proceed, consuming a probe slot if HALF_OPEN
    fn admit(&self) -> Result<(), CircuitOpenError> {
        let mut transitions = Vec::new();

        let verdict = {
            let mut inner = self.inner.lock();
            inner.metrics.total_calls += 1;

            let mut verdict = Ok(());

            if inner.state == BreakerState::Open {
                let reset_timeout = self.config.reset_timeout();
                let elapsed = inner
                    .opened_at
                    .map(|t| t.elapsed())
                    .unwrap_or(reset_timeout);

                if elapsed >= reset_timeout {
                    transitions.push(self.transition(&mut inner, BreakerState::HalfOpen));
                } else {
                    verdict = Err(self.open_error(reset_timeout - elapsed));
                }
            }

            if verdict.is_ok() && inner.state == BreakerState::HalfOpen {
                inner.half_open_calls += 1;
                if inner.half_open_calls > self.config.half_open_max_calls {
                    transitions.push(self.transition(&mut inner, BreakerState::Open));
                    verdict = Err(self.open_error(self.config.reset_timeout()));
                }
            }

            verdict
        };

        for transition in &transitions {
            self.notify(transition);
        }
        verdict
    }

    fn on_success(&self) {
        let transition = {
            let mut inner = self.inner.lock();
            inner.metrics.total_successes += 1;

            match inner.state {
                BreakerState::HalfOpen => {
                    inner.successes += 1;
                    if inner.successes >= self.config.half_open_max_calls {
                        Some(self.transition(&mut inner, BreakerState::Closed))
                    } else {
                        None
                    }
                }
                BreakerState::Closed => {
                    inner.failures = inner.failures.saturating_sub(1);
                    None
                }
                BreakerState::Open => None,
            }
        };

        if let Some(transition) = transition {
            self.notify(&transition);
        }
    }

    fn on_failure(&self) {
        let transition = {
            let mut inner = self.inner.lock();
            inner.failures += 1;
            inner.metrics.total_failures += 1;
            inner.last_failure_at = Some(Utc::now());

            match inner.state {
                BreakerState::HalfOpen => Some(self.transition(&mut inner, BreakerState::Open)),
                BreakerState::Closed if inner.failures >= self.config.failure_threshold => {
                    Some(self.transition(&mut inner, BreakerState::Open))
                }
                _ => None,
            }
        };

        if let Some(transition) = transition {
            self.notify(&transition);
        }
    }

    /// Apply a state change. Caller holds the lock and must notify afterwards.
    fn transition(&self, inner: &mut BreakerInner, to: BreakerState) -> BreakerTransition {
        let from = inner.state;
        inner.state = to;
        inner.last_transition_at = Utc::now();

        match to {
            BreakerState::Open => {
                inner.metrics.trips += 1;
                inner.opened_at = Some(Instant::now());
            }
            BreakerState::Closed => {
                inner.failures = 0;
                inner.successes = 0;
            }
            BreakerState::HalfOpen => {
                inner.half_open_calls = 0;
                inner.successes = 0;
            }
        }

        BreakerTransition {
            breaker: self.name.clone(),
            from,
            to,
            timestamp: inner.last_transition_at,
        }
    }

    fn notify(&self, transition: &BreakerTransition) {
        if transition.to == BreakerState::Open {
            warn!(breaker = %self.name, from = %transition.from, "Circuit breaker opened");
        } else {
            info!(breaker = %self.name, from = %transition.from, to = %transition.to, "Circuit breaker transition");
        }

        if let Some(listener) = &self.listener {
            listener(transition);
        }
    }

    fn open_error(&self, retry_after: Duration) -> CircuitOpenError {
        CircuitOpenError {
            name: self.name.clone(),
            retry_after,
        }
    }
}

/// Named breakers, one per downstream target
pub struct BreakerRegistry {
    defaults: BreakerConfig,
    overrides: HashMap<String, BreakerConfig>,
    breakers: RwLock<BTreeMap<String, Arc<CircuitBreaker>>>,
    listener: Option<TransitionListener>,
}

impl BreakerRegistry {
    pub fn new(defaults: BreakerConfig, overrides: HashMap<String, BreakerConfig>) -> Self {
        Self {
            defaults,
            overrides,
            breakers: RwLock::new(BTreeMap::new()),
            listener: None,
        }
    }

    /// Listener attached to every breaker created from now on
    pub fn with_listener(mut self, listener: TransitionListener) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Get the breaker for `name`, creating it on first use
    pub fn get(&self, name: &str) -> Arc<CircuitBreaker> {
        if let Some(breaker) = self.breakers.read().get(name) {
            return breaker.clone();
        }

        let mut breakers = self.breakers.write();
        breakers
            .entry(name.to_string())
            .or_insert_with(|| {
                let config = self
                    .overrides
                    .get(name)
                    .cloned()
                    .unwrap_or_else(|| self.defaults.clone());
                let mut breaker = CircuitBreaker::new(name, config);
                if let Some(listener) = &self.listener {
                    breaker = breaker.with_listener(listener.clone());
                }
                Arc::new(breaker)
            })
            .clone()
    }

    /// Get a breaker only if it already exists
    pub fn find(&self, name: &str) -> Option<Arc<CircuitBreaker>> {
        self.breakers.read().get(name).cloned()
    }

    /// Reset a named breaker. Returns false if it does not exist.
    pub fn reset(&self, name: &str) -> bool {
        match self.find(name) {
            Some(breaker) => {
                breaker.reset();
                true
            }
            None => false,
        }
    }

    pub fn statuses(&self) -> BTreeMap<String, BreakerStatus> {
        self.breakers
            .read()
            .iter()
            .map(|(name, breaker)| (name.clone(), breaker.status()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[derive(Debug, PartialEq)]
    enum TestError {
        Open,
        Boom,
    }

    impl From<CircuitOpenError> for TestError {
        fn from(_: CircuitOpenError) -> Self {
            TestError::Open
        }
    }

    fn config(threshold: u32) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: threshold,
            reset_timeout_ms: 1000,
            half_open_max_calls: 2,
        }
    }

    async fn fail(breaker: &CircuitBreaker) -> Result<(), TestError> {
        breaker.execute(|| async { Err::<(), _>(TestError::Boom) }).await
    }

    async fn succeed(breaker: &CircuitBreaker) -> Result<(), TestError> {
        breaker.execute(|| async { Ok::<(), TestError>(()) }).await
    }

    #[tokio::test]
    async fn test_success_decays_failures() {
        let breaker = CircuitBreaker::new("svc", config(3));

        let _ = fail(&breaker).await;
        let _ = fail(&breaker).await;
        succeed(&breaker).await.unwrap();
        assert_eq!(breaker.status().failure_count, 1);

        // 1 + 1 = 2 failures, still below threshold
        let _ = fail(&breaker).await;
        assert_eq!(breaker.state(), BreakerState::Closed);

        let _ = fail(&breaker).await;
        assert_eq!(breaker.state(), BreakerState::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_failure_reopens() {
        let breaker = CircuitBreaker::new("svc", config(1));
        let _ = fail(&breaker).await;
        assert_eq!(breaker.state(), BreakerState::Open);

        tokio::time::advance(Duration::from_millis(1000)).await;
        assert_eq!(fail(&breaker).await, Err(TestError::Boom));
        assert_eq!(breaker.state(), BreakerState::Open);
        assert_eq!(breaker.status().metrics.trips, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_half_open_probe_budget() {
        let breaker = Arc::new(CircuitBreaker::new("svc", config(1)));
        let _ = fail(&breaker).await;
        tokio::time::advance(Duration::from_millis(1000)).await;

        // Two probes in flight consume the whole budget
        let (release_tx, release_rx) = tokio::sync::watch::channel(false);
        let mut probes = Vec::new();
        for _ in 0..2 {
            let breaker = breaker.clone();
            let mut rx = release_rx.clone();
            probes.push(tokio::spawn(async move {
                breaker
                    .execute(|| async move {
                        let _ = rx.wait_for(|released| *released).await;
                        Ok::<(), TestError>(())
                    })
                    .await
            }));
        }
        tokio::task::yield_now().await;
        assert_eq!(breaker.state(), BreakerState::HalfOpen);

        // A third concurrent probe exceeds the budget and re-opens
        assert_eq!(succeed(&breaker).await, Err(TestError::Open));
        assert_eq!(breaker.state(), BreakerState::Open);

        release_tx.send(true).unwrap();
        for probe in probes {
            probe.await.unwrap().unwrap();
        }
    }

    #[tokio::test]
    async fn test_fallback_served_while_open() {
        let breaker = CircuitBreaker::new("svc", config(1));
        let calls = AtomicU32::new(0);

        let result: Result<&str, TestError> = breaker
            .execute_with_fallback(
                || async { Err(TestError::Boom) },
                |_open| async { Ok("fallback") },
            )
            .await;
        assert_eq!(result, Ok("fallback"));

        let result: Result<&str, TestError> = breaker
            .execute_with_fallback(
                || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok("live")
                },
                |open| async move {
                    assert_eq!(open.name, "svc");
                    Ok("fallback")
                },
            )
            .await;
        assert_eq!(result, Ok("fallback"));
        assert_eq!(calls.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_transitions_are_published() {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = seen.clone();
        let breaker = CircuitBreaker::new("svc", config(1))
            .with_listener(Arc::new(move |t: &BreakerTransition| sink.lock().push((t.from, t.to))));

        let _ = fail(&breaker).await;
        breaker.reset();

        assert_eq!(
            *seen.lock(),
            vec![
                (BreakerState::Closed, BreakerState::Open),
                (BreakerState::Open, BreakerState::Closed)
            ]
        );
    }

    #[test]
    fn test_registry_overrides() {
        let mut overrides = HashMap::new();
        overrides.insert("cloud".to_string(), config(3));
        let registry = BreakerRegistry::new(BreakerConfig::default(), overrides);

        assert_eq!(registry.get("cloud").config().failure_threshold, 3);
        assert_eq!(registry.get("brain").config().failure_threshold, 5);
        assert!(Arc::ptr_eq(&registry.get("cloud"), &registry.get("cloud")));
        assert!(!registry.reset("missing"));
        assert_eq!(registry.statuses().len(), 2);
    }
}
