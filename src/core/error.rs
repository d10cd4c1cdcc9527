//! Error taxonomy for planning and execution.
//!
//! Task-level errors carry enough structure to pick a retry profile;
//! run-level errors map to an `ErrorKind` code and a remediation hint for
//! telemetry and the HTTP surface.

use thiserror::Error;

use super::constraints::ConstraintViolation;
use crate::adapters::AgentError;
use crate::domain::{ErrorKind, ErrorSummary};
use crate::resilience::{CircuitOpenError, Classify, ErrorClass, PoolError};

/// Planning failures
#[derive(Debug, Clone, Error, PartialEq)]
pub enum PlanError {
    #[error("Unknown workflow type: {0}")]
    UnknownWorkflowType(String),

    #[error("Task '{task_id}' references unknown agent '{agent}'")]
    UnknownAgent { task_id: String, agent: String },

    #[error("Invalid template '{name}': {reason}")]
    InvalidTemplate { name: String, reason: String },
}

/// A single task attempt failed
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TaskError {
    #[error(transparent)]
    Agent(#[from] AgentError),

    #[error("Acceptance criteria not met, missing: {}", missing.join(", "))]
    AcceptanceCriteria { missing: Vec<String> },

    #[error(transparent)]
    CircuitOpen(#[from] CircuitOpenError),

    #[error(transparent)]
    Pool(#[from] PoolError),

    #[error("Timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },

    #[error("Unknown agent '{0}'")]
    UnknownAgent(String),
}

impl Classify for TaskError {
    fn classify(&self) -> ErrorClass {
        match self {
            TaskError::Agent(e) => e.classify(),
            TaskError::AcceptanceCriteria { .. } => ErrorClass::Transient,
            // Fail fast; the breaker already decided the target is down
            TaskError::CircuitOpen(_) => ErrorClass::Fatal,
            TaskError::Pool(PoolError::Exhausted { .. }) => ErrorClass::Overload,
            TaskError::Pool(PoolError::Timeout { .. }) => ErrorClass::Timeout,
            TaskError::Timeout { .. } => ErrorClass::Timeout,
            TaskError::UnknownAgent(_) => ErrorClass::Fatal,
        }
    }
}

impl TaskError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            TaskError::Agent(_) | TaskError::UnknownAgent(_) => ErrorKind::TaskExecution,
            TaskError::AcceptanceCriteria { .. } => ErrorKind::AcceptanceCriteriaFailure,
            TaskError::CircuitOpen(_) => ErrorKind::CircuitOpen,
            TaskError::Pool(PoolError::Exhausted { .. }) => ErrorKind::PoolExhausted,
            TaskError::Pool(PoolError::Timeout { .. }) => ErrorKind::PoolTimeout,
            TaskError::Timeout { .. } => ErrorKind::TaskTimeout,
        }
    }
}

/// A run aborted
#[derive(Debug, Clone, Error, PartialEq)]
pub enum RunError {
    #[error("Task '{task_id}' failed after {attempts} attempt(s): {source}")]
    Task {
        task_id: String,
        attempts: u32,
        #[source]
        source: TaskError,
    },

    #[error(transparent)]
    Constraint(#[from] ConstraintViolation),

    #[error("No runnable tasks; unsatisfied inputs block: {}", pending.join(", "))]
    Unschedulable { pending: Vec<String> },

    #[error("Run cancelled")]
    Cancelled,
}

impl RunError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            RunError::Task { source, .. } => source.kind(),
            RunError::Constraint(_) => ErrorKind::ConstraintViolation,
            RunError::Unschedulable { .. } => ErrorKind::Unschedulable,
            RunError::Cancelled => ErrorKind::Cancelled,
        }
    }

    /// Operator-facing advice for this failure
    pub fn remediation(&self) -> &'static str {
        match self.kind() {
            ErrorKind::UnknownWorkflowType => "Use one of the registered workflow types (taskweave templates).",
            ErrorKind::TaskExecution => "The agent call failed after retries; check the agent's health and logs.",
            ErrorKind::AcceptanceCriteriaFailure => {
                "The agent responded but did not satisfy the task's acceptance criteria; review the agent output or the criteria."
            }
            ErrorKind::CircuitOpen => {
                "The agent's circuit breaker is open; wait for the reset timeout or reset it manually once the agent recovers."
            }
            ErrorKind::PoolExhausted => {
                "The connection pool rejected the call immediately because its queue is full; reduce load or raise the pool's queue limit."
            }
            ErrorKind::PoolTimeout => {
                "The call waited too long for a pool slot; slow calls are holding the pool, raise max_concurrent or the pool timeout."
            }
            ErrorKind::TaskTimeout => "The agent did not answer within the task timeout; raise timeout_ms or check agent latency.",
            ErrorKind::ConstraintViolation => {
                "The run exceeded its token or cost budget; completed results are preserved. Raise the budget to finish."
            }
            ErrorKind::Unschedulable => {
                "Some task inputs can never be satisfied; check the workflow's input and output names."
            }
            ErrorKind::Cancelled => "The run was cancelled by an operator.",
        }
    }

    /// Kind and message, as reported to telemetry
    pub fn summary(&self) -> ErrorSummary {
        ErrorSummary {
            kind: self.kind(),
            message: self.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_pool_errors_have_distinct_kinds() {
        let exhausted = TaskError::Pool(PoolError::Exhausted {
            pool: "ai".to_string(),
            active: 6,
            queued: 20,
        });
        let timeout = TaskError::Pool(PoolError::Timeout {
            pool: "ai".to_string(),
            timeout_ms: 60_000,
        });

        assert_eq!(exhausted.kind(), ErrorKind::PoolExhausted);
        assert_eq!(timeout.kind(), ErrorKind::PoolTimeout);
        assert_eq!(exhausted.classify(), ErrorClass::Overload);
        assert_eq!(timeout.classify(), ErrorClass::Timeout);

        let a = RunError::Task {
            task_id: "t".to_string(),
            attempts: 3,
            source: exhausted,
        };
        let b = RunError::Task {
            task_id: "t".to_string(),
            attempts: 4,
            source: timeout,
        };
        assert_ne!(a.remediation(), b.remediation());
    }

    #[test]
    fn test_circuit_open_is_not_retried() {
        let err = TaskError::CircuitOpen(CircuitOpenError {
            name: "agent".to_string(),
            retry_after: Duration::from_secs(10),
        });
        assert_eq!(err.classify(), ErrorClass::Fatal);
        assert_eq!(err.kind(), ErrorKind::CircuitOpen);
    }

    #[test]
    fn test_summary_has_no_debug_noise() {
        let err = RunError::Constraint(ConstraintViolation::TokenBudget {
            used: 12_000,
            limit: 10_000,
        });
        let summary = err.summary();
        assert_eq!(summary.kind, ErrorKind::ConstraintViolation);
        assert_eq!(summary.message, "Token limit exceeded: 12000 > 10000");
    }
}
