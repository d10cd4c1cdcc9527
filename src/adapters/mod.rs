//! Agent client interfaces.
//!
//! The executor talks to remote agents only through `AgentClient`.
//! Two implementations ship with the crate:
//! - HttpAgentClient: JSON over HTTP to the agent endpoints
//! - ScriptedAgentClient: deterministic in-process responses for dry runs and tests

pub mod http;
pub mod scripted;

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::domain::{AgentDescriptor, ImpactTier, TaskType};
use crate::resilience::{classify_message, Classify, ErrorClass};

pub use http::HttpAgentClient;
pub use scripted::ScriptedAgentClient;

/// Payload sent to an agent for one task attempt
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentCall {
    pub run_id: Uuid,
    pub workflow_type: String,
    pub impact_tier: ImpactTier,
    pub task_id: String,
    #[serde(rename = "type")]
    pub task_type: TaskType,
    pub agent: String,

    /// Resolved input values keyed by input name
    pub inputs: BTreeMap<String, serde_json::Value>,

    /// Criteria the response will be checked against
    pub acceptance_criteria: Vec<String>,

    pub max_tokens: u64,
    pub timeout_ms: u64,
    pub temperature: f64,
}

/// What an agent returned
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentResponse {
    pub content: serde_json::Value,

    #[serde(default)]
    pub tokens_used: u64,

    /// Cost reported by the agent; the executor falls back to the cost tier
    #[serde(default)]
    pub cost: Option<f64>,
}

impl AgentResponse {
    pub fn new(content: serde_json::Value, tokens_used: u64) -> Self {
        Self {
            content,
            tokens_used,
            cost: None,
        }
    }
}

/// Result of probing an agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentHealth {
    pub agent: String,
    pub healthy: bool,
    pub latency_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub detail: Option<String>,
}

/// Errors returned by agent clients
#[derive(Debug, Clone, Error, PartialEq)]
pub enum AgentError {
    #[error("Agent '{agent}' timed out")]
    Timeout { agent: String },

    #[error("Agent '{agent}' rate limit exceeded (429)")]
    RateLimited { agent: String },

    #[error("Agent '{agent}' overloaded (503)")]
    Overloaded { agent: String },

    #[error("Agent '{agent}' returned HTTP {status}: {body}")]
    Http {
        agent: String,
        status: u16,
        body: String,
    },

    #[error("Agent '{agent}' transport error: {message}")]
    Transport { agent: String, message: String },

    #[error("Agent '{agent}' returned an invalid response: {message}")]
    InvalidResponse { agent: String, message: String },
}

impl Classify for AgentError {
    fn classify(&self) -> ErrorClass {
        match self {
            AgentError::Timeout { .. } => ErrorClass::Timeout,
            AgentError::RateLimited { .. } => ErrorClass::RateLimit,
            AgentError::Overloaded { .. } => ErrorClass::Overload,
            AgentError::Http { status, .. } if *status >= 500 => ErrorClass::Transient,
            AgentError::Http { .. } => ErrorClass::Fatal,
            AgentError::Transport { message, .. } => classify_message(message),
            AgentError::InvalidResponse { .. } => ErrorClass::Transient,
        }
    }
}

/// Map an HTTP status to the matching error
pub fn error_for_status(agent: &str, status: u16, body: String) -> AgentError {
    match status {
        429 => AgentError::RateLimited {
            agent: agent.to_string(),
        },
        503 => AgentError::Overloaded {
            agent: agent.to_string(),
        },
        _ => AgentError::Http {
            agent: agent.to_string(),
            status,
            body,
        },
    }
}

/// Trait for remote agent backends
#[async_trait]
pub trait AgentClient: Send + Sync {
    /// Human-readable client name
    fn name(&self) -> &str;

    /// Perform one call. Retries, breakers and pools are the caller's job.
    async fn call(&self, agent: &AgentDescriptor, call: &AgentCall) -> Result<AgentResponse, AgentError>;

    /// Probe an agent's availability
    async fn health_check(&self, agent: &AgentDescriptor) -> AgentHealth;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_classification() {
        assert_eq!(error_for_status("a", 429, String::new()).classify(), ErrorClass::RateLimit);
        assert_eq!(error_for_status("a", 503, String::new()).classify(), ErrorClass::Overload);
        assert_eq!(error_for_status("a", 500, String::new()).classify(), ErrorClass::Transient);
        assert_eq!(error_for_status("a", 400, String::new()).classify(), ErrorClass::Fatal);
    }

    #[test]
    fn test_transport_errors_use_message() {
        let err = AgentError::Transport {
            agent: "a".to_string(),
            message: "operation timed out".to_string(),
        };
        assert_eq!(err.classify(), ErrorClass::Timeout);
    }
}
