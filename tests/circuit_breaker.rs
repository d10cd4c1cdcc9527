//! Circuit Breaker Integration Tests
//!
//! Trip and recovery timing against tokio's paused clock.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use taskweave::resilience::{BreakerConfig, BreakerState, CircuitBreaker, CircuitOpenError};

#[derive(Debug, PartialEq)]
enum CallError {
    Open(Duration),
    Failed,
}

impl From<CircuitOpenError> for CallError {
    fn from(e: CircuitOpenError) -> Self {
        CallError::Open(e.retry_after)
    }
}

fn breaker() -> CircuitBreaker {
    CircuitBreaker::new(
        "profile-extractor",
        BreakerConfig {
            failure_threshold: 5,
            reset_timeout_ms: 30_000,
            half_open_max_calls: 3,
        },
    )
}

async fn call(breaker: &CircuitBreaker, calls: &AtomicUsize, ok: bool) -> Result<(), CallError> {
    breaker
        .execute(move || async move {
            calls.fetch_add(1, Ordering::SeqCst);
            if ok {
                Ok(())
            } else {
                Err(CallError::Failed)
            }
        })
        .await
}

#[tokio::test(start_paused = true)]
async fn test_open_until_reset_timeout_elapses() {
    let breaker = breaker();
    let calls = AtomicUsize::new(0);

    for _ in 0..5 {
        assert_eq!(call(&breaker, &calls, false).await, Err(CallError::Failed));
    }
    assert_eq!(breaker.state(), BreakerState::Open);
    assert_eq!(calls.load(Ordering::SeqCst), 5);

    // Rejected without invoking the wrapped function
    let rejected = call(&breaker, &calls, true).await;
    assert!(matches!(rejected, Err(CallError::Open(_))));
    assert_eq!(calls.load(Ordering::SeqCst), 5);

    tokio::time::advance(Duration::from_millis(29_999)).await;
    assert!(matches!(call(&breaker, &calls, true).await, Err(CallError::Open(_))));
    assert_eq!(breaker.state(), BreakerState::Open);
    assert_eq!(calls.load(Ordering::SeqCst), 5);

    tokio::time::advance(Duration::from_millis(2)).await;
    assert_eq!(call(&breaker, &calls, true).await, Ok(()));
    assert_eq!(calls.load(Ordering::SeqCst), 6);
    assert_eq!(breaker.state(), BreakerState::HalfOpen);
}

#[tokio::test(start_paused = true)]
async fn test_probe_successes_close_the_circuit() {
    let breaker = breaker();
    let calls = AtomicUsize::new(0);

    for _ in 0..5 {
        let _ = call(&breaker, &calls, false).await;
    }
    tokio::time::advance(Duration::from_millis(30_001)).await;

    for _ in 0..3 {
        assert_eq!(call(&breaker, &calls, true).await, Ok(()));
    }
    assert_eq!(breaker.state(), BreakerState::Closed);
    assert_eq!(breaker.status().failure_count, 0);
}

#[tokio::test(start_paused = true)]
async fn test_retry_after_counts_down() {
    let breaker = breaker();
    let calls = AtomicUsize::new(0);

    for _ in 0..5 {
        let _ = call(&breaker, &calls, false).await;
    }
    tokio::time::advance(Duration::from_millis(10_000)).await;

    match call(&breaker, &calls, true).await {
        Err(CallError::Open(retry_after)) => assert_eq!(retry_after, Duration::from_millis(20_000)),
        other => panic!("expected open circuit, got {:?}", other),
    }
}
