//! Run budget enforcement.
//!
//! Checked by the executor after every batch:
//! - Token budget (hard)
//! - Cost budget (hard)
//! - Target latency (soft, reported to the caller as an overrun)

use std::time::Duration;

use thiserror::Error;

use crate::domain::{RunConstraints, RunMetrics};

/// A hard budget was exceeded
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ConstraintViolation {
    #[error("Token limit exceeded: {used} > {limit}")]
    TokenBudget { used: u64, limit: u64 },

    #[error("Cost limit exceeded: ${spent:.4} > ${limit:.4}")]
    CostBudget { spent: f64, limit: f64 },
}

/// Outcome of a constraint check that did not abort the run
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ConstraintCheck {
    /// Set when the run has exceeded its target latency
    pub latency_overrun_ms: Option<u64>,
}

/// Check run metrics against the run's budget
pub fn check_constraints(
    constraints: &RunConstraints,
    metrics: &RunMetrics,
    elapsed: Duration,
) -> Result<ConstraintCheck, ConstraintViolation> {
    if let Some(limit) = constraints.max_tokens {
        if metrics.tokens_used > limit {
            return Err(ConstraintViolation::TokenBudget {
                used: metrics.tokens_used,
                limit,
            });
        }
    }

    if let Some(limit) = constraints.max_cost {
        if metrics.cost_incurred > limit {
            return Err(ConstraintViolation::CostBudget {
                spent: metrics.cost_incurred,
                limit,
            });
        }
    }

    let mut check = ConstraintCheck::default();
    if let Some(target) = constraints.target_latency_ms {
        let elapsed_ms = elapsed.as_millis() as u64;
        if elapsed_ms > target {
            check.latency_overrun_ms = Some(elapsed_ms - target);
        }
    }

    Ok(check)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metrics(tokens: u64, cost: f64) -> RunMetrics {
        RunMetrics {
            tokens_used: tokens,
            cost_incurred: cost,
            ..Default::default()
        }
    }

    #[test]
    fn test_no_constraints_always_passes() {
        let check = check_constraints(
            &RunConstraints::default(),
            &metrics(1_000_000, 100.0),
            Duration::from_secs(3600),
        );
        assert_eq!(check, Ok(ConstraintCheck::default()));
    }

    #[test]
    fn test_token_budget_is_strict() {
        let constraints = RunConstraints {
            max_tokens: Some(1000),
            ..Default::default()
        };

        assert!(check_constraints(&constraints, &metrics(1000, 0.0), Duration::ZERO).is_ok());
        assert_eq!(
            check_constraints(&constraints, &metrics(1001, 0.0), Duration::ZERO),
            Err(ConstraintViolation::TokenBudget {
                used: 1001,
                limit: 1000
            })
        );
    }

    #[test]
    fn test_cost_budget() {
        let constraints = RunConstraints {
            max_cost: Some(0.05),
            ..Default::default()
        };
        let result = check_constraints(&constraints, &metrics(0, 0.07), Duration::ZERO);
        assert!(matches!(result, Err(ConstraintViolation::CostBudget { .. })));
    }

    #[test]
    fn test_latency_is_soft() {
        let constraints = RunConstraints {
            target_latency_ms: Some(100),
            ..Default::default()
        };
        let check = check_constraints(&constraints, &metrics(0, 0.0), Duration::from_millis(250)).unwrap();
        assert_eq!(check.latency_overrun_ms, Some(150));
    }
}
