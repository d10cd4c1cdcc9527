//! Domain types for the taskweave orchestrator.
//!
//! This module contains the core data structures:
//! - Workflow: planned specs and their tasks
//! - Run: execution state, metrics and results
//! - Agent: descriptors for remote agents
//! - Events: telemetry emitted for external consumers

pub mod agent;
pub mod events;
pub mod run;
pub mod workflow;

// Re-export commonly used types
pub use agent::{AgentDescriptor, AgentRegistry, CostTier};
pub use events::{
    AgentBreakdown, LatencyOverrun, Outcome, ResourceUsage, TelemetryEvent, TelemetryReport,
};
pub use run::{
    ErrorKind, ErrorSummary, RunConstraints, RunMetrics, RunState, RunStatus, TaskResult,
};
pub use workflow::{HumanCheckpoint, ImpactConstraint, ImpactTier, Task, TaskType, WorkflowSpec};
