//! taskweave - Task-graph workflow orchestrator
//!
//! Turns a free-text goal into a dependency graph of agent tasks and runs
//! it against remote AI agents.
//!
//! # Architecture
//!
//! - The planner picks a workflow template and scales it to the goal
//! - The executor schedules ready tasks in parallel batches, enforcing
//!   the run's budget after each batch
//! - Every agent call goes through a retry loop, a circuit breaker, a
//!   connection pool and a response cache
//! - Finished runs are reported on a telemetry stream
//!
//! # Modules
//!
//! - `adapters`: Agent clients (HTTP, scripted)
//! - `core`: Planning, execution, telemetry and the service graph
//! - `domain`: Data structures (Task, WorkflowSpec, RunState)
//! - `resilience`: Breaker, cache, pool, rate limiter and retry
//! - `server`: HTTP API
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Plan and run a workflow
//! taskweave run founder-intake "Raise a seed round for a climate startup"
//!
//! # Serve the HTTP API
//! taskweave serve --bind 0.0.0.0:8080
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;
pub mod resilience;
pub mod server;

// Re-export main types at crate root for convenience
pub use adapters::{AgentClient, HttpAgentClient, ScriptedAgentClient};
pub use core::{Executor, Planner, RunOutcome, Services, TemplateRegistry};
pub use domain::{AgentRegistry, RunState, RunStatus, Task, WorkflowSpec};
pub use resilience::Resilience;
