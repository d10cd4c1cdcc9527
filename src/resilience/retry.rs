//! Retry with per-class backoff profiles.
//!
//! Every failure is classified; the class picks how many retries are
//! allowed and how long to wait between them. Fatal errors never retry.

use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::warn;

/// Retry classification of an error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    Timeout,
    RateLimit,
    Overload,
    Transient,
    Fatal,
}

impl ErrorClass {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorClass::Timeout => "timeout",
            ErrorClass::RateLimit => "rate_limit",
            ErrorClass::Overload => "overload",
            ErrorClass::Transient => "transient",
            ErrorClass::Fatal => "fatal",
        }
    }
}

/// Errors that know how they should be retried
pub trait Classify {
    fn classify(&self) -> ErrorClass;
}

/// Classify an untyped error by its message
pub fn classify_message(message: &str) -> ErrorClass {
    let msg = message.to_lowercase();

    if msg.contains("timeout") || msg.contains("timed out") || msg.contains("etimedout") {
        ErrorClass::Timeout
    } else if msg.contains("rate limit") || msg.contains("rate-limit") || msg.contains("429") {
        ErrorClass::RateLimit
    } else if msg.contains("overload") || msg.contains("capacity") || msg.contains("503") {
        ErrorClass::Overload
    } else {
        // Connection resets (ECONNRESET, ECONNREFUSED, EPIPE) and
        // unrecognised tool failures get the single transient retry
        ErrorClass::Transient
    }
}

/// How the delay grows between retries
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackoffStrategy {
    Exponential,
    Linear,
    Fixed,
}

/// Retry budget and delay curve for one error class
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Backoff {
    pub strategy: BackoffStrategy,
    /// Retries allowed after the first attempt
    pub max_retries: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Backoff {
    pub fn new(strategy: BackoffStrategy, max_retries: u32, base_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            strategy,
            max_retries,
            base_delay_ms,
            max_delay_ms,
        }
    }

    /// Delay before retry number `retry` (1-indexed)
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        let retry = retry.max(1);
        let delay = match self.strategy {
            BackoffStrategy::Exponential => {
                let factor = 2u64.saturating_pow(retry - 1);
                self.base_delay_ms.saturating_mul(factor)
            }
            BackoffStrategy::Linear => self.base_delay_ms.saturating_mul(retry as u64),
            BackoffStrategy::Fixed => self.base_delay_ms,
        };
        Duration::from_millis(delay.min(self.max_delay_ms))
    }
}

/// Per-class retry profiles
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    #[serde(default = "default_timeout_backoff")]
    pub timeout: Backoff,

    #[serde(default = "default_rate_limit_backoff")]
    pub rate_limit: Backoff,

    #[serde(default = "default_overload_backoff")]
    pub overload: Backoff,

    #[serde(default = "default_transient_backoff")]
    pub transient: Backoff,

    /// Hard cap on attempts regardless of class, including the first try
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// Scale each delay to a random 50-100% of its value
    #[serde(default)]
    pub jitter: bool,
}

fn default_timeout_backoff() -> Backoff {
    Backoff::new(BackoffStrategy::Exponential, 3, 1_000, 10_000)
}
fn default_rate_limit_backoff() -> Backoff {
    Backoff::new(BackoffStrategy::Linear, 2, 5_000, 15_000)
}
fn default_overload_backoff() -> Backoff {
    Backoff::new(BackoffStrategy::Exponential, 2, 2_000, 8_000)
}
fn default_transient_backoff() -> Backoff {
    Backoff::new(BackoffStrategy::Fixed, 1, 1_000, 1_000)
}
fn default_max_attempts() -> u32 {
    4
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            timeout: default_timeout_backoff(),
            rate_limit: default_rate_limit_backoff(),
            overload: default_overload_backoff(),
            transient: default_transient_backoff(),
            max_attempts: default_max_attempts(),
            jitter: false,
        }
    }
}

impl RetryPolicy {
    /// A policy that never retries
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            ..Self::default()
        }
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Backoff profile for a class; `None` for fatal errors
    pub fn profile(&self, class: ErrorClass) -> Option<&Backoff> {
        match class {
            ErrorClass::Timeout => Some(&self.timeout),
            ErrorClass::RateLimit => Some(&self.rate_limit),
            ErrorClass::Overload => Some(&self.overload),
            ErrorClass::Transient => Some(&self.transient),
            ErrorClass::Fatal => None,
        }
    }

    /// Delay before retrying after failed attempt `attempt` (1-indexed),
    /// or `None` if the error should be returned
    pub fn next_delay(&self, class: ErrorClass, attempt: u32) -> Option<Duration> {
        if attempt >= self.max_attempts {
            return None;
        }
        let profile = self.profile(class)?;
        if attempt > profile.max_retries {
            return None;
        }

        let delay = profile.delay_for_retry(attempt);
        if self.jitter {
            let scale: f64 = rand::rng().random_range(0.5..=1.0);
            Some(delay.mul_f64(scale))
        } else {
            Some(delay)
        }
    }
}

/// Run `op` until it succeeds, fails fatally or runs out of retries.
///
/// `op` receives the 1-indexed attempt number.
pub async fn retry<F, Fut, T, E>(policy: &RetryPolicy, mut op: F) -> Result<T, E>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: Classify + std::fmt::Display,
{
    let mut attempt = 1;

    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) => {
                let class = e.classify();
                let Some(delay) = policy.next_delay(class, attempt) else {
                    return Err(e);
                };

                warn!(
                    attempt,
                    class = class.as_str(),
                    delay_ms = delay.as_millis() as u64,
                    error = %e,
                    "Attempt failed, retrying"
                );
                tokio::time::sleep(delay).await;
                attempt += 1;
            }
        }
    }
}
