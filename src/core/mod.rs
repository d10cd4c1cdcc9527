//! Core orchestration logic.
//!
//! This module contains:
//! - Templates: workflow templates and their loading
//! - Planner: goal analysis and workflow spec construction
//! - Profiles: per-tier default budgets and priority
//! - Executor: dependency-driven task scheduling
//! - Constraints: run budget enforcement
//! - Telemetry: run reports and their persistence
//! - Services: the shared service graph

pub mod capacity;
pub mod constraints;
pub mod error;
pub mod executor;
pub mod planner;
pub mod profiles;
pub mod runs;
pub mod services;
pub mod telemetry;
pub mod templates;
pub mod validator;

// Re-export commonly used types
pub use constraints::{check_constraints, ConstraintCheck, ConstraintViolation};
pub use error::{PlanError, RunError, TaskError};
pub use executor::{AgentCallMetrics, Executor, ExecutorConfig, RunFailure, RunOutcome};
pub use planner::{Evaluation, NextAction, PlanMetadata, Planner, Urgency};
pub use profiles::{ResourceProfile, ResourceTier};
pub use runs::{CancelOutcome, RunHandle, RunRegistry};
pub use services::{AgentHealthReport, Services, ServicesBuilder};
pub use telemetry::{build_report, TelemetrySink, TelemetryStore};
pub use templates::{TemplateRegistry, WorkflowTemplate};
pub use validator::{AcceptanceValidator, SubstringValidator};
