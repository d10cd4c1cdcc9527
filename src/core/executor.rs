//! Workflow executor.
//!
//! Runs a planned `WorkflowSpec` to completion:
//! 1. Registers the run and seeds external inputs
//! 2. Repeatedly picks the tasks whose inputs are available
//! 3. Runs the parallel group concurrently, then the sequential tasks one by one
//! 4. Re-checks the run budget after every batch
//! 5. Emits a telemetry report when the run reaches a terminal status,
//!    including when the caller drops the run before it finishes

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::time::{timeout, Instant};
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

use super::capacity::CapacityGate;
use super::constraints::check_constraints;
use super::error::{RunError, TaskError};
use super::runs::{RunHandle, RunRegistry, DEFAULT_RETENTION};
use super::telemetry::{build_report, TelemetrySink};
use super::validator::AcceptanceValidator;
use crate::adapters::{AgentCall, AgentClient, AgentError, AgentResponse};
use crate::domain::{
    AgentDescriptor, AgentRegistry, LatencyOverrun, RunMetrics, RunState, RunStatus, Task,
    TaskResult, TelemetryEvent, TelemetryReport, WorkflowSpec,
};
use crate::resilience::{retry, Resilience, RetryPolicy};

/// Cache holding agent responses
pub const RESPONSE_CACHE: &str = "ai";

/// Executor settings
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutorConfig {
    /// Seconds a finished run stays queryable
    #[serde(default = "default_retention_secs")]
    pub retention_secs: u64,

    /// Timeout applied to tasks that do not declare one
    #[serde(default = "default_task_timeout_ms")]
    pub default_task_timeout_ms: u64,

    /// Retry profiles per error class
    #[serde(default)]
    pub retry: RetryPolicy,
}

fn default_retention_secs() -> u64 {
    DEFAULT_RETENTION.as_secs()
}

fn default_task_timeout_ms() -> u64 {
    30_000
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            retention_secs: default_retention_secs(),
            default_task_timeout_ms: default_task_timeout_ms(),
            retry: RetryPolicy::default(),
        }
    }
}

impl ExecutorConfig {
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.retention_secs)
    }
}

/// Call statistics for one agent across all runs
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentCallMetrics {
    pub calls: u64,
    pub successes: u64,
    pub failures: u64,
    pub total_latency_ms: u64,
    pub tokens: u64,
}

impl AgentCallMetrics {
    pub fn success_rate(&self) -> Option<f64> {
        (self.calls > 0).then(|| self.successes as f64 / self.calls as f64)
    }

    pub fn average_latency_ms(&self) -> Option<f64> {
        (self.calls > 0).then(|| self.total_latency_ms as f64 / self.calls as f64)
    }
}

/// A run that completed every task
#[derive(Debug, Clone, Serialize)]
pub struct RunOutcome {
    pub run_id: Uuid,
    pub success: bool,
    pub results: BTreeMap<String, TaskResult>,
    pub metrics: RunMetrics,
    pub telemetry: TelemetryReport,
}

/// A run that aborted; `state` keeps every result recorded before the abort
#[derive(Debug, Clone, Error)]
#[error("Run {} {}: {error}", .state.run_id, .state.status.as_str())]
pub struct RunFailure {
    pub error: RunError,
    pub state: RunState,
    pub telemetry: TelemetryReport,
}

/// Failure of a single task after retries
#[derive(Debug)]
struct TaskFailure {
    error: TaskError,
    attempts: u32,
}

/// What to do after a batch settled
enum Verdict {
    Continue,
    Completed,
    Aborted(RunError),
}

/// Executes workflow specs against agents through the resilience stack
#[derive(Clone)]
pub struct Executor {
    agents: Arc<AgentRegistry>,
    client: Arc<dyn AgentClient>,
    validator: Arc<dyn AcceptanceValidator>,
    resilience: Arc<Resilience>,
    runs: Arc<RunRegistry>,
    telemetry: TelemetrySink,
    capacity: Arc<CapacityGate>,
    config: Arc<ExecutorConfig>,
    agent_metrics: Arc<Mutex<BTreeMap<String, AgentCallMetrics>>>,
}

impl Executor {
    pub fn new(
        agents: Arc<AgentRegistry>,
        client: Arc<dyn AgentClient>,
        validator: Arc<dyn AcceptanceValidator>,
        resilience: Arc<Resilience>,
        runs: Arc<RunRegistry>,
        telemetry: TelemetrySink,
        config: ExecutorConfig,
    ) -> Self {
        Self {
            agents,
            client,
            validator,
            resilience,
            runs,
            telemetry,
            capacity: Arc::new(CapacityGate::new()),
            config: Arc::new(config),
            agent_metrics: Arc::new(Mutex::new(BTreeMap::new())),
        }
    }

    pub fn config(&self) -> &ExecutorConfig {
        &self.config
    }

    /// Per-agent call statistics
    pub fn agent_metrics(&self) -> BTreeMap<String, AgentCallMetrics> {
        self.agent_metrics.lock().clone()
    }

    /// Register a run for `spec` without starting it
    pub fn register(&self, spec: &WorkflowSpec) -> Arc<RunHandle> {
        self.runs.register(RunState::new(
            spec.run_id,
            spec.workflow_type.clone(),
            spec.tasks.len(),
            spec.constraints.clone(),
        ))
    }

    /// Register and execute a workflow
    pub async fn run(&self, spec: &WorkflowSpec) -> Result<RunOutcome, RunFailure> {
        let handle = self.register(spec);
        self.execute(spec, handle).await
    }

    /// Execute a registered workflow until it completes, fails or is cancelled
    #[instrument(skip_all, fields(run_id = %spec.run_id, workflow_type = %spec.workflow_type))]
    pub async fn execute(&self, spec: &WorkflowSpec, handle: Arc<RunHandle>) -> Result<RunOutcome, RunFailure> {
        let run_id = spec.run_id;
        let started = Instant::now();
        info!(%run_id, tasks = spec.tasks.len(), "Starting workflow execution");
        let _abandon = AbandonGuard {
            executor: self,
            spec,
            handle: handle.clone(),
        };

        let mut available: BTreeMap<String, Value> = spec
            .seed_inputs()
            .into_iter()
            .map(|key| {
                let value = spec.seed_value(&key);
                (key, value)
            })
            .collect();
        let mut pending: Vec<&Task> = spec.tasks.iter().collect();

        let verdict = loop {
            if handle.is_cancelled() {
                break Verdict::Aborted(RunError::Cancelled);
            }
            if pending.is_empty() {
                // Only reachable for a workflow without tasks
                break handle.update(|state| settle(state, spec, started, Vec::new(), true)).verdict;
            }

            let (ready, blocked): (Vec<&Task>, Vec<&Task>) = std::mem::take(&mut pending)
                .into_iter()
                .partition(|task| task.inputs.iter().all(|input| available.contains_key(input)));

            if ready.is_empty() {
                let error = RunError::Unschedulable {
                    pending: blocked.iter().map(|t| t.id.clone()).collect(),
                };
                break handle.update(|state| {
                    state.finish(RunStatus::Failed, Some(error.summary()));
                    Verdict::Aborted(error)
                });
            }
            pending = blocked;

            let (parallel, sequential): (Vec<&Task>, Vec<&Task>) = ready.into_iter().partition(|task| task.parallel);
            debug!(
                %run_id,
                parallel = parallel.len(),
                sequential = sequential.len(),
                "Scheduling batch"
            );

            let mut verdict = Verdict::Continue;

            if !parallel.is_empty() {
                let settled = self.run_parallel(spec, &parallel, &available).await;
                publish(&mut available, &settled);
                let last = pending.is_empty() && sequential.is_empty();
                let batch = handle.update(|state| settle(state, spec, started, settled, last));
                self.report_overrun(spec, &batch);
                verdict = batch.verdict;
            }

            for (i, task) in sequential.iter().enumerate() {
                if !matches!(verdict, Verdict::Continue) {
                    break;
                }
                if handle.is_cancelled() {
                    verdict = Verdict::Aborted(RunError::Cancelled);
                    break;
                }
                let outcome = self.execute_task(spec, task, resolve_inputs(task, &available)).await;
                let settled = vec![((*task).clone(), outcome)];
                publish(&mut available, &settled);
                let last = pending.is_empty() && i + 1 == sequential.len();
                let batch = handle.update(|state| settle(state, spec, started, settled, last));
                self.report_overrun(spec, &batch);
                verdict = batch.verdict;
            }

            if !matches!(verdict, Verdict::Continue) {
                break verdict;
            }
        };

        let state = handle.snapshot();
        let telemetry = build_report(spec, &state, &self.agents);
        self.telemetry.emit(TelemetryEvent::RunReport(telemetry.clone()));

        match verdict {
            Verdict::Completed => {
                info!(
                    %run_id,
                    duration_ms = state.metrics.total_duration_ms,
                    tokens = state.metrics.tokens_used,
                    "Workflow completed"
                );
                Ok(RunOutcome {
                    run_id,
                    success: true,
                    results: state.results,
                    metrics: state.metrics,
                    telemetry,
                })
            }
            Verdict::Aborted(error) => {
                if matches!(error, RunError::Cancelled) {
                    warn!(%run_id, completed = state.metrics.completed_tasks, "Workflow cancelled");
                } else {
                    error!(%run_id, error = %error, "Workflow failed");
                }
                Err(RunFailure {
                    error,
                    state,
                    telemetry,
                })
            }
            // The loop only breaks on a terminal verdict
            Verdict::Continue => Err(RunFailure {
                error: RunError::Cancelled,
                state,
                telemetry,
            }),
        }
    }

    /// Run a parallel group; every task settles before this returns
    async fn run_parallel(
        &self,
        spec: &WorkflowSpec,
        tasks: &[&Task],
        available: &BTreeMap<String, Value>,
    ) -> Vec<(Task, Result<TaskResult, TaskFailure>)> {
        let spec = Arc::new(spec.clone());
        let handles: Vec<_> = tasks
            .iter()
            .map(|task| {
                let this = self.clone();
                let spec = spec.clone();
                let task = (*task).clone();
                let inputs = resolve_inputs(&task, available);
                tokio::spawn(async move { this.execute_task(&spec, &task, inputs).await })
            })
            .collect();

        let mut settled = Vec::with_capacity(tasks.len());
        for (task, handle) in tasks.iter().zip(handles) {
            let outcome = match handle.await {
                Ok(outcome) => outcome,
                Err(e) => Err(TaskFailure {
                    error: TaskError::Agent(AgentError::Transport {
                        agent: task.agent.clone(),
                        message: format!("task aborted: {}", e),
                    }),
                    attempts: 1,
                }),
            };
            settled.push(((*task).clone(), outcome));
        }
        settled
    }

    /// Execute one task with retries
    async fn execute_task(
        &self,
        spec: &WorkflowSpec,
        task: &Task,
        inputs: BTreeMap<String, Value>,
    ) -> Result<TaskResult, TaskFailure> {
        let Some(agent) = self.agents.get(&task.agent) else {
            return Err(TaskFailure {
                error: TaskError::UnknownAgent(task.agent.clone()),
                attempts: 1,
            });
        };

        let _slot = self.capacity.acquire(agent).await;
        let started = Instant::now();

        let timeout_ms = if task.timeout_ms == 0 {
            self.config.default_task_timeout_ms
        } else {
            task.timeout_ms
        };
        let call = AgentCall {
            run_id: spec.run_id,
            workflow_type: spec.workflow_type.clone(),
            impact_tier: spec.impact_tier,
            task_id: task.id.clone(),
            task_type: task.task_type,
            agent: agent.id.clone(),
            inputs,
            acceptance_criteria: task.acceptance_criteria.clone(),
            max_tokens: task.max_tokens,
            timeout_ms,
            temperature: agent.temperature,
        };
        let key = cache_key(&agent.id, &task.id, &call.inputs);

        let breaker_handle = self.resilience.breaker(&agent.id);
        let pool_handle = self.resilience.pool(&agent.pool);
        let cache_handle = self.resilience.cache(RESPONSE_CACHE);

        let breaker = &*breaker_handle;
        let pool = &*pool_handle;
        let cache = &*cache_handle;
        let call = &call;
        let key = key.as_str();
        let attempts = AtomicU32::new(0);
        let attempts_seen = &attempts;

        let result = retry(&self.config.retry, move |attempt| async move {
            attempts_seen.store(attempt, Ordering::Relaxed);
            debug!(task = %task.id, attempt, "Calling agent");

            let fresh = AtomicBool::new(false);
            let fresh_flag = &fresh;
            let value = breaker
                .execute_with_fallback(
                    move || {
                        pool.execute(move || {
                            cache.get_or_try_set(
                                key,
                                move || async move {
                                    fresh_flag.store(true, Ordering::Relaxed);
                                    self.call_agent(agent, call).await
                                },
                                None,
                            )
                        })
                    },
                    // While the circuit is open a cached response beats failing the task
                    move |open| async move {
                        fresh_flag.store(false, Ordering::Relaxed);
                        match cache.get(key) {
                            Some(value) => {
                                debug!(task = %task.id, agent = %agent.id, "Circuit open, serving cached response");
                                Ok(value)
                            }
                            None => Err(TaskError::CircuitOpen(open)),
                        }
                    },
                )
                .await?;

            let response: AgentResponse = match serde_json::from_value(value) {
                Ok(response) => response,
                Err(e) => {
                    cache.invalidate(key);
                    return Err(TaskError::Agent(AgentError::InvalidResponse {
                        agent: agent.id.clone(),
                        message: e.to_string(),
                    }));
                }
            };

            let missing = self.validator.missing_criteria(task, &response.content);
            if !missing.is_empty() {
                cache.invalidate(key);
                return Err(TaskError::AcceptanceCriteria { missing });
            }

            Ok::<_, TaskError>((response, !fresh.load(Ordering::Relaxed)))
        })
        .await;

        let attempts = attempts.load(Ordering::Relaxed).max(1);
        match result {
            Ok((response, cached)) => {
                let (tokens_used, cost) = if cached {
                    (0, 0.0)
                } else {
                    (
                        response.tokens_used,
                        response.cost.unwrap_or_else(|| agent.cost_tier.cost_per_call()),
                    )
                };
                info!(
                    task = %task.id,
                    agent = %agent.id,
                    attempts,
                    cached,
                    latency_ms = started.elapsed().as_millis() as u64,
                    "Task completed"
                );
                Ok(TaskResult {
                    task_id: task.id.clone(),
                    agent: agent.id.clone(),
                    content: response.content,
                    tokens_used,
                    cost,
                    latency_ms: started.elapsed().as_millis() as u64,
                    attempts,
                    cached,
                })
            }
            Err(error) => {
                error!(
                    task = %task.id,
                    agent = %agent.id,
                    attempts,
                    error = %error,
                    "Task failed permanently"
                );
                Err(TaskFailure { error, attempts })
            }
        }
    }

    /// One agent call bounded by the task timeout, serialized for the cache
    async fn call_agent(&self, agent: &AgentDescriptor, call: &AgentCall) -> Result<Value, TaskError> {
        let started = Instant::now();
        let outcome = timeout(Duration::from_millis(call.timeout_ms), self.client.call(agent, call)).await;
        let latency_ms = started.elapsed().as_millis() as u64;

        let response = match outcome {
            Ok(Ok(response)) => response,
            Ok(Err(e)) => {
                self.record_call(&agent.id, latency_ms, None);
                return Err(e.into());
            }
            Err(_) => {
                self.record_call(&agent.id, latency_ms, None);
                return Err(TaskError::Timeout {
                    timeout_ms: call.timeout_ms,
                });
            }
        };

        self.record_call(&agent.id, latency_ms, Some(response.tokens_used));
        serde_json::to_value(&response).map_err(|e| {
            TaskError::Agent(AgentError::InvalidResponse {
                agent: agent.id.clone(),
                message: e.to_string(),
            })
        })
    }

    /// Warn and publish when a batch ends past the run's latency target
    fn report_overrun(&self, spec: &WorkflowSpec, batch: &Settled) {
        let Some(overrun_ms) = batch.latency_overrun_ms else {
            return;
        };
        let target_ms = spec.constraints.target_latency_ms.unwrap_or_default();
        warn!(run_id = %spec.run_id, overrun_ms, target_ms, "Run is past its latency target");
        self.telemetry.emit(TelemetryEvent::LatencyOverrun(LatencyOverrun {
            run_id: spec.run_id,
            workflow_type: spec.workflow_type.clone(),
            target_ms,
            overrun_ms,
            timestamp: Utc::now(),
        }));
    }

    fn record_call(&self, agent: &str, latency_ms: u64, tokens: Option<u64>) {
        let mut metrics = self.agent_metrics.lock();
        let entry = metrics.entry(agent.to_string()).or_default();
        entry.calls += 1;
        entry.total_latency_ms += latency_ms;
        match tokens {
            Some(tokens) => {
                entry.successes += 1;
                entry.tokens += tokens;
            }
            None => entry.failures += 1,
        }
    }
}

/// Verdict for a settled batch, plus a latency overrun if the run is past
/// its target
struct Settled {
    verdict: Verdict,
    latency_overrun_ms: Option<u64>,
}

impl From<Verdict> for Settled {
    fn from(verdict: Verdict) -> Self {
        Self {
            verdict,
            latency_overrun_ms: None,
        }
    }
}

/// Record a settled batch into the run state. Runs under the state lock so
/// the final result and the terminal status become visible together.
fn settle(
    state: &mut RunState,
    spec: &WorkflowSpec,
    started: Instant,
    settled: Vec<(Task, Result<TaskResult, TaskFailure>)>,
    last_batch: bool,
) -> Settled {
    if !state.is_running() {
        return Verdict::Aborted(RunError::Cancelled).into();
    }

    let mut first_failure: Option<RunError> = None;
    for (task, outcome) in settled {
        match outcome {
            Ok(result) => {
                state.record_success(result);
            }
            Err(failure) => {
                state.record_failure(&task.id);
                if first_failure.is_none() {
                    first_failure = Some(RunError::Task {
                        task_id: task.id.clone(),
                        attempts: failure.attempts,
                        source: failure.error,
                    });
                }
            }
        }
    }

    if let Some(error) = first_failure {
        state.finish(RunStatus::Failed, Some(error.summary()));
        return Verdict::Aborted(error).into();
    }

    let check = match check_constraints(&spec.constraints, &state.metrics, started.elapsed()) {
        Ok(check) => check,
        Err(violation) => {
            let error = RunError::from(violation);
            warn!(run_id = %state.run_id, error = %error, "Run budget exceeded");
            state.finish(RunStatus::Failed, Some(error.summary()));
            return Verdict::Aborted(error).into();
        }
    };

    let verdict = if last_batch {
        state.finish(RunStatus::Completed, None);
        Verdict::Completed
    } else {
        Verdict::Continue
    };
    Settled {
        verdict,
        latency_overrun_ms: check.latency_overrun_ms,
    }
}

/// Settles a run whose execution future is dropped before the run finished,
/// so it leaves the running set and ages out of the registry
struct AbandonGuard<'a> {
    executor: &'a Executor,
    spec: &'a WorkflowSpec,
    handle: Arc<RunHandle>,
}

impl Drop for AbandonGuard<'_> {
    fn drop(&mut self) {
        let abandoned = self.handle.update(|state| {
            if !state.is_running() {
                return false;
            }
            state.finish(RunStatus::Cancelled, Some(RunError::Cancelled.summary()));
            true
        });
        if !abandoned {
            return;
        }

        let state = self.handle.snapshot();
        warn!(
            run_id = %self.spec.run_id,
            completed = state.metrics.completed_tasks,
            "Workflow abandoned before it finished"
        );
        let report = build_report(self.spec, &state, &self.executor.agents);
        self.executor.telemetry.emit(TelemetryEvent::RunReport(report));
    }
}

/// Make successful results visible to dependents under their id and outputs
fn publish(available: &mut BTreeMap<String, Value>, settled: &[(Task, Result<TaskResult, TaskFailure>)]) {
    for (task, outcome) in settled {
        if let Ok(result) = outcome {
            available.insert(task.id.clone(), result.content.clone());
            for output in &task.outputs {
                available.insert(output.clone(), result.content.clone());
            }
        }
    }
}

fn resolve_inputs(task: &Task, available: &BTreeMap<String, Value>) -> BTreeMap<String, Value> {
    task.inputs
        .iter()
        .filter_map(|input| available.get(input).map(|value| (input.clone(), value.clone())))
        .collect()
}

/// Cache key for an agent response: hash of agent, task and inputs
pub fn cache_key(agent: &str, task_id: &str, inputs: &BTreeMap<String, Value>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(agent.as_bytes());
    hasher.update(b":");
    hasher.update(task_id.as_bytes());
    hasher.update(b":");
    hasher.update(serde_json::to_string(inputs).unwrap_or_default().as_bytes());
    format!("{}:{}", agent, hex::encode(hasher.finalize()))
}
