//! Telemetry stream and its JSONL persistence.
//!
//! Reports and breaker transitions are published on a broadcast channel.
//! Consumers subscribe; the optional recorder task appends every event to
//! `telemetry/events.jsonl` under the taskweave home for later replay.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::Utc;
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::domain::{
    AgentBreakdown, AgentRegistry, CostTier, Outcome, ResourceUsage, RunState, RunStatus,
    TelemetryEvent, TelemetryReport, WorkflowSpec,
};
use crate::resilience::{BreakerTransition, TransitionListener};

const CHANNEL_CAPACITY: usize = 256;

/// Broadcast side of the telemetry stream
#[derive(Debug, Clone)]
pub struct TelemetrySink {
    tx: broadcast::Sender<TelemetryEvent>,
}

impl Default for TelemetrySink {
    fn default() -> Self {
        Self::new()
    }
}

impl TelemetrySink {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self { tx }
    }

    /// Publish an event. Having no subscribers is not an error.
    pub fn emit(&self, event: TelemetryEvent) {
        if self.tx.send(event).is_err() {
            debug!("Telemetry event dropped: no subscribers");
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<TelemetryEvent> {
        self.tx.subscribe()
    }

    /// Listener that forwards circuit breaker transitions onto this stream
    pub fn transition_listener(&self) -> TransitionListener {
        let tx = self.tx.clone();
        Arc::new(move |transition: &BreakerTransition| {
            let _ = tx.send(TelemetryEvent::BreakerTransition(transition.clone()));
        })
    }
}

/// Build the report for a run that reached a terminal status
pub fn build_report(spec: &WorkflowSpec, state: &RunState, agents: &AgentRegistry) -> TelemetryReport {
    let mut task_breakdown: BTreeMap<String, AgentBreakdown> = BTreeMap::new();
    for task in &spec.tasks {
        let entry = task_breakdown.entry(task.agent.clone()).or_default();
        entry.count += 1;
        if let Some(result) = state.results.get(&task.id) {
            entry.completed += 1;
            entry.total_latency_ms += result.latency_ms;
            entry.total_tokens += result.tokens_used;
        }
    }
    for entry in task_breakdown.values_mut() {
        entry.success_rate = if entry.count == 0 {
            0.0
        } else {
            entry.completed as f64 / entry.count as f64
        };
    }

    let mut model_tiers: BTreeMap<String, u32> = [CostTier::Small, CostTier::Medium, CostTier::Large]
        .iter()
        .map(|tier| (tier.as_str().to_string(), 0))
        .collect();
    for result in state.results.values() {
        if let Some(agent) = agents.get(&result.agent) {
            *model_tiers.entry(agent.cost_tier.as_str().to_string()).or_insert(0) += 1;
        }
    }

    TelemetryReport {
        run_id: state.run_id,
        workflow_type: state.workflow_type.clone(),
        impact_tier: spec.impact_tier,
        status: state.status,
        started_at: state.started_at,
        ended_at: state.ended_at,
        metrics: state.metrics.clone(),
        task_breakdown,
        resource_usage: ResourceUsage { model_tiers },
        outcome: Outcome {
            success: state.status == RunStatus::Completed,
            error: state.error.clone(),
        },
        timestamp: Utc::now(),
    }
}

/// Append-only JSONL store for telemetry events
#[derive(Debug, Clone)]
pub struct TelemetryStore {
    events_path: PathBuf,
}

impl TelemetryStore {
    /// Open the store in `dir`, creating it if needed
    pub async fn open(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        fs::create_dir_all(dir)
            .await
            .with_context(|| format!("Failed to create telemetry directory: {}", dir.display()))?;

        Ok(Self {
            events_path: dir.join("events.jsonl"),
        })
    }

    pub fn events_path(&self) -> &Path {
        &self.events_path
    }

    /// Append an event to the log
    pub async fn append(&self, event: &TelemetryEvent) -> Result<()> {
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.events_path)
            .await
            .with_context(|| format!("Failed to open telemetry file: {}", self.events_path.display()))?;

        let json = serde_json::to_string(event).context("Failed to serialize telemetry event")?;
        file.write_all(format!("{}\n", json).as_bytes())
            .await
            .context("Failed to write telemetry event")?;
        file.flush().await.context("Failed to flush telemetry event")?;

        Ok(())
    }

    /// Replay all events in order
    pub async fn replay(&self) -> Result<Vec<TelemetryEvent>> {
        if !self.events_path.exists() {
            return Ok(Vec::new());
        }

        let file = File::open(&self.events_path)
            .await
            .with_context(|| format!("Failed to open telemetry file: {}", self.events_path.display()))?;

        let mut lines = BufReader::new(file).lines();
        let mut events = Vec::new();

        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            let event: TelemetryEvent = serde_json::from_str(&line)
                .with_context(|| format!("Failed to parse telemetry event: {}", line))?;
            events.push(event);
        }

        Ok(events)
    }

    /// Run reports only, most recent last
    pub async fn reports(&self) -> Result<Vec<TelemetryReport>> {
        Ok(self
            .replay()
            .await?
            .into_iter()
            .filter_map(|event| match event {
                TelemetryEvent::RunReport(report) => Some(report),
                TelemetryEvent::BreakerTransition(_) | TelemetryEvent::LatencyOverrun(_) => None,
            })
            .collect())
    }

    /// Spawn a task that appends every event published on `sink`
    pub fn spawn_recorder(self, sink: &TelemetrySink) -> JoinHandle<()> {
        let mut rx = sink.subscribe();
        tokio::spawn(async move {
            loop {
                match rx.recv().await {
                    Ok(event) => {
                        if let Err(e) = self.append(&event).await {
                            warn!(error = %e, "Failed to persist telemetry event");
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Telemetry recorder lagged, events lost");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{RunConstraints, TaskResult, TaskType, Task, ImpactTier};
    use crate::resilience::BreakerState;
    use tempfile::TempDir;
    use uuid::Uuid;

    fn spec() -> WorkflowSpec {
        WorkflowSpec {
            run_id: Uuid::new_v4(),
            workflow_type: "founder-intake".to_string(),
            goal: "goal".to_string(),
            description: String::new(),
            tasks: vec![
                Task::new("a", TaskType::Research, "profile-extractor"),
                Task::new("b", TaskType::Research, "profile-extractor"),
                Task::new("c", TaskType::Writing, "content-writer"),
            ],
            success_criteria: Vec::new(),
            impact_constraints: Vec::new(),
            impact_tier: ImpactTier::Standard,
            human_in_loop: Vec::new(),
            constraints: RunConstraints::default(),
            context: BTreeMap::new(),
            estimated_duration_ms: 0,
            created_at: Utc::now(),
        }
    }

    fn result(task_id: &str, agent: &str) -> TaskResult {
        TaskResult {
            task_id: task_id.to_string(),
            agent: agent.to_string(),
            content: serde_json::json!("ok"),
            tokens_used: 100,
            cost: 0.02,
            latency_ms: 40,
            attempts: 1,
            cached: false,
        }
    }

    #[test]
    fn test_report_breakdown() {
        let spec = spec();
        let agents = AgentRegistry::builtin();
        let mut state = RunState::new(spec.run_id, spec.workflow_type.clone(), 3, RunConstraints::default());
        state.record_success(result("a", "profile-extractor"));
        state.record_success(result("c", "content-writer"));
        state.finish(RunStatus::Completed, None);

        let report = build_report(&spec, &state, &agents);
        let extractor = &report.task_breakdown["profile-extractor"];
        assert_eq!(extractor.count, 2);
        assert_eq!(extractor.completed, 1);
        assert_eq!(extractor.total_tokens, 100);
        assert_eq!(extractor.success_rate, 0.5);
        assert_eq!(report.resource_usage.model_tiers.values().sum::<u32>(), 2);
        assert!(report.outcome.success);
    }

    #[tokio::test]
    async fn test_append_and_replay() {
        let dir = TempDir::new().unwrap();
        let store = TelemetryStore::open(dir.path().join("telemetry")).await.unwrap();

        let transition = BreakerTransition {
            breaker: "content-writer".to_string(),
            from: BreakerState::Closed,
            to: BreakerState::Open,
            timestamp: Utc::now(),
        };
        store
            .append(&TelemetryEvent::BreakerTransition(transition))
            .await
            .unwrap();

        let events = store.replay().await.unwrap();
        assert_eq!(events.len(), 1);
        assert!(store.reports().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_recorder_persists_stream() {
        let dir = TempDir::new().unwrap();
        let store = TelemetryStore::open(dir.path()).await.unwrap();
        let sink = TelemetrySink::new();
        let recorder = store.clone().spawn_recorder(&sink);

        let listener = sink.transition_listener();
        listener(&BreakerTransition {
            breaker: "x".to_string(),
            from: BreakerState::Open,
            to: BreakerState::HalfOpen,
            timestamp: Utc::now(),
        });
        drop(listener);
        drop(sink);
        recorder.await.unwrap();

        assert_eq!(store.replay().await.unwrap().len(), 1);
    }
}
