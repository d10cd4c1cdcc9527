//! Run state for a single workflow execution.
//!
//! A RunState is owned by the executor while the run is in progress and
//! becomes immutable once its status leaves `running`.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle status of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    #[default]
    Running,
    Completed,
    Failed,
    Cancelled,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            RunStatus::Running => "running",
            RunStatus::Completed => "completed",
            RunStatus::Failed => "failed",
            RunStatus::Cancelled => "cancelled",
        }
    }
}

/// Budget enforced by the executor between batches
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunConstraints {
    /// Total token budget for the run
    #[serde(default)]
    pub max_tokens: Option<u64>,

    /// Total cost budget in USD
    #[serde(default)]
    pub max_cost: Option<f64>,

    /// Soft latency target; overruns only log a warning
    #[serde(default)]
    pub target_latency_ms: Option<u64>,
}

/// Aggregate metrics for a run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunMetrics {
    pub total_tasks: usize,
    pub completed_tasks: usize,
    pub failed_tasks: usize,
    pub tokens_used: u64,
    pub cost_incurred: f64,
    /// Mean latency of completed tasks
    pub average_latency_ms: f64,
    /// Wall-clock duration, set when the run finishes
    #[serde(default)]
    pub total_duration_ms: u64,
}

impl RunMetrics {
    pub fn success_rate(&self) -> f64 {
        if self.total_tasks == 0 {
            return 0.0;
        }
        self.completed_tasks as f64 / self.total_tasks as f64
    }
}

/// Output recorded for a completed task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskResult {
    pub task_id: String,
    pub agent: String,
    pub content: serde_json::Value,
    pub tokens_used: u64,
    pub cost: f64,
    pub latency_ms: u64,
    /// Number of attempts it took, including the successful one
    pub attempts: u32,
    /// Whether the agent response came from the cache
    pub cached: bool,
}

/// Machine-readable classification of a terminal error
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    UnknownWorkflowType,
    TaskExecution,
    AcceptanceCriteriaFailure,
    CircuitOpen,
    PoolExhausted,
    PoolTimeout,
    TaskTimeout,
    ConstraintViolation,
    Unschedulable,
    Cancelled,
}

/// Terminal error as surfaced to users and telemetry: never a backtrace
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorSummary {
    pub kind: ErrorKind,
    pub message: String,
}

/// State of a workflow run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunState {
    pub run_id: Uuid,
    pub workflow_type: String,
    pub status: RunStatus,
    /// Results keyed by task id
    pub results: BTreeMap<String, TaskResult>,
    pub metrics: RunMetrics,
    pub constraints: RunConstraints,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub error: Option<ErrorSummary>,
}

impl RunState {
    /// Create a running state for a workflow with `total_tasks` tasks
    pub fn new(
        run_id: Uuid,
        workflow_type: String,
        total_tasks: usize,
        constraints: RunConstraints,
    ) -> Self {
        Self {
            run_id,
            workflow_type,
            status: RunStatus::Running,
            results: BTreeMap::new(),
            metrics: RunMetrics {
                total_tasks,
                ..Default::default()
            },
            constraints,
            started_at: Utc::now(),
            ended_at: None,
            error: None,
        }
    }

    /// Record a task result. Returns false if the run is no longer running
    /// or the task already has a result.
    pub fn record_success(&mut self, result: TaskResult) -> bool {
        if !self.is_running() || self.results.contains_key(&result.task_id) {
            return false;
        }
        if self.metrics.completed_tasks + self.metrics.failed_tasks >= self.metrics.total_tasks {
            return false;
        }

        let completed = self.metrics.completed_tasks as f64;
        self.metrics.average_latency_ms = (self.metrics.average_latency_ms * completed
            + result.latency_ms as f64)
            / (completed + 1.0);
        self.metrics.completed_tasks += 1;
        self.metrics.tokens_used += result.tokens_used;
        self.metrics.cost_incurred += result.cost;
        self.results.insert(result.task_id.clone(), result);
        true
    }

    /// Record a task failure
    pub fn record_failure(&mut self, task_id: &str) -> bool {
        if !self.is_running() || self.results.contains_key(task_id) {
            return false;
        }
        if self.metrics.completed_tasks + self.metrics.failed_tasks >= self.metrics.total_tasks {
            return false;
        }
        self.metrics.failed_tasks += 1;
        true
    }

    /// Move the run to a terminal status. No-op if already finished.
    pub fn finish(&mut self, status: RunStatus, error: Option<ErrorSummary>) {
        if !self.is_running() || status == RunStatus::Running {
            return;
        }
        let ended_at = Utc::now();
        self.metrics.total_duration_ms = (ended_at - self.started_at)
            .num_milliseconds()
            .max(0) as u64;
        self.status = status;
        self.ended_at = Some(ended_at);
        self.error = error;
    }

    pub fn is_running(&self) -> bool {
        self.status == RunStatus::Running
    }

    pub fn is_finished(&self) -> bool {
        !self.is_running()
    }

    pub fn has_result(&self, task_id: &str) -> bool {
        self.results.contains_key(task_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn result(task_id: &str, latency_ms: u64) -> TaskResult {
        TaskResult {
            task_id: task_id.to_string(),
            agent: "agent".to_string(),
            content: serde_json::json!("ok"),
            tokens_used: 100,
            cost: 0.02,
            latency_ms,
            attempts: 1,
            cached: false,
        }
    }

    #[test]
    fn test_result_recorded_once() {
        let mut state = RunState::new(Uuid::new_v4(), "t".to_string(), 2, RunConstraints::default());

        assert!(state.record_success(result("a", 100)));
        assert!(!state.record_success(result("a", 100)));
        assert!(!state.record_failure("a"));

        assert_eq!(state.metrics.completed_tasks, 1);
        assert_eq!(state.metrics.tokens_used, 100);
    }

    #[test]
    fn test_average_latency() {
        let mut state = RunState::new(Uuid::new_v4(), "t".to_string(), 2, RunConstraints::default());
        state.record_success(result("a", 100));
        state.record_success(result("b", 300));

        assert_eq!(state.metrics.average_latency_ms, 200.0);
        assert_eq!(state.metrics.success_rate(), 1.0);
    }

    #[test]
    fn test_counts_never_exceed_total() {
        let mut state = RunState::new(Uuid::new_v4(), "t".to_string(), 1, RunConstraints::default());
        assert!(state.record_success(result("a", 10)));
        assert!(!state.record_failure("b"));
        assert_eq!(state.metrics.completed_tasks + state.metrics.failed_tasks, 1);
    }

    #[test]
    fn test_finished_state_is_frozen() {
        let mut state = RunState::new(Uuid::new_v4(), "t".to_string(), 2, RunConstraints::default());
        state.finish(RunStatus::Cancelled, None);

        assert!(state.is_finished());
        assert!(!state.record_success(result("a", 10)));

        state.finish(RunStatus::Completed, None);
        assert_eq!(state.status, RunStatus::Cancelled);
        assert!(state.ended_at.is_some());
    }
}
