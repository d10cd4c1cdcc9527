//! Telemetry events emitted by the orchestrator.
//!
//! Events leaving this layer: a report per finished run (completed, failed
//! or cancelled), a record per circuit breaker transition, and a warning
//! when a run passes its latency target. All are append-only facts for
//! external consumers.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::run::{ErrorSummary, RunMetrics, RunStatus};
use super::workflow::ImpactTier;
use crate::resilience::BreakerTransition;

/// A single event on the telemetry stream
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum TelemetryEvent {
    /// A run reached a terminal status
    RunReport(TelemetryReport),

    /// A circuit breaker changed state
    BreakerTransition(BreakerTransition),

    /// A run passed its soft latency target
    LatencyOverrun(LatencyOverrun),
}

impl TelemetryEvent {
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            TelemetryEvent::RunReport(report) => report.timestamp,
            TelemetryEvent::BreakerTransition(transition) => transition.timestamp,
            TelemetryEvent::LatencyOverrun(overrun) => overrun.timestamp,
        }
    }
}

/// Emitted after a batch that ended past the run's target latency
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LatencyOverrun {
    pub run_id: Uuid,
    pub workflow_type: String,
    pub target_ms: u64,
    pub overrun_ms: u64,
    pub timestamp: DateTime<Utc>,
}

/// Per-agent slice of a run's work
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentBreakdown {
    pub count: u32,
    pub completed: u32,
    pub total_latency_ms: u64,
    pub total_tokens: u64,
    pub success_rate: f64,
}

/// Model tier usage for a run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourceUsage {
    /// Tasks dispatched per model tier ("small", "medium", "large")
    pub model_tiers: BTreeMap<String, u32>,
}

/// How a run ended
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Outcome {
    pub success: bool,
    pub error: Option<ErrorSummary>,
}

/// Final report for a run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetryReport {
    pub run_id: Uuid,
    pub workflow_type: String,
    pub impact_tier: ImpactTier,
    pub status: RunStatus,
    pub started_at: DateTime<Utc>,
    pub ended_at: Option<DateTime<Utc>>,
    pub metrics: RunMetrics,
    pub task_breakdown: BTreeMap<String, AgentBreakdown>,
    pub resource_usage: ResourceUsage,
    pub outcome: Outcome,
    pub timestamp: DateTime<Utc>,
}
