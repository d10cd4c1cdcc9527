//! Deterministic in-process agent client.
//!
//! Used by `taskweave run --dry-run` and throughout the test suite. By
//! default every call succeeds with a response that mentions the task id
//! and every acceptance criterion, so the default validator accepts it.
//! Replies can be scripted per agent to inject failures.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde_json::json;

use super::{AgentCall, AgentClient, AgentError, AgentHealth, AgentResponse};
use crate::domain::AgentDescriptor;

/// A scripted reply, consumed by the next call to its agent
#[derive(Debug, Clone)]
pub enum ScriptedReply {
    /// Return this response verbatim
    Respond(AgentResponse),
    /// Fail the call
    Fail(AgentError),
    /// Succeed, but without mentioning the acceptance criteria
    Incomplete,
}

#[derive(Debug, Default)]
struct ScriptState {
    replies: HashMap<String, VecDeque<ScriptedReply>>,
    calls: Vec<AgentCall>,
    in_flight: HashMap<String, usize>,
    peak_in_flight: HashMap<String, usize>,
    unhealthy: HashSet<String>,
}

/// Agent client with canned, deterministic behaviour
#[derive(Debug)]
pub struct ScriptedAgentClient {
    tokens_per_call: u64,
    latency: Duration,
    agent_latency: HashMap<String, Duration>,
    state: Mutex<ScriptState>,
}

impl Default for ScriptedAgentClient {
    fn default() -> Self {
        Self::new()
    }
}

impl ScriptedAgentClient {
    pub fn new() -> Self {
        Self {
            tokens_per_call: 500,
            latency: Duration::ZERO,
            agent_latency: HashMap::new(),
            state: Mutex::new(ScriptState::default()),
        }
    }

    /// Tokens reported by every default response
    pub fn with_tokens_per_call(mut self, tokens: u64) -> Self {
        self.tokens_per_call = tokens;
        self
    }

    /// Simulated latency for every call
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// Simulated latency for one agent, overriding the global one
    pub fn with_agent_latency(mut self, agent: &str, latency: Duration) -> Self {
        self.agent_latency.insert(agent.to_string(), latency);
        self
    }

    /// Queue a reply for the next call to `agent`
    pub fn push(&self, agent: &str, reply: ScriptedReply) {
        self.state
            .lock()
            .replies
            .entry(agent.to_string())
            .or_default()
            .push_back(reply);
    }

    /// Queue the same failure `times` times
    pub fn fail_times(&self, agent: &str, error: AgentError, times: usize) {
        for _ in 0..times {
            self.push(agent, ScriptedReply::Fail(error.clone()));
        }
    }

    /// Report `agent` as unhealthy in health checks
    pub fn mark_unhealthy(&self, agent: &str) {
        self.state.lock().unhealthy.insert(agent.to_string());
    }

    /// Every call received so far, in arrival order
    pub fn calls(&self) -> Vec<AgentCall> {
        self.state.lock().calls.clone()
    }

    pub fn call_count(&self) -> usize {
        self.state.lock().calls.len()
    }

    /// Calls received per agent
    pub fn calls_by_agent(&self) -> BTreeMap<String, usize> {
        let mut counts = BTreeMap::new();
        for call in &self.state.lock().calls {
            *counts.entry(call.agent.clone()).or_insert(0) += 1;
        }
        counts
    }

    /// Highest number of simultaneous calls seen for `agent`
    pub fn peak_in_flight(&self, agent: &str) -> usize {
        self.state
            .lock()
            .peak_in_flight
            .get(agent)
            .copied()
            .unwrap_or(0)
    }

    fn default_response(&self, call: &AgentCall, with_criteria: bool) -> AgentResponse {
        let criteria = if with_criteria {
            call.acceptance_criteria.clone()
        } else {
            Vec::new()
        };
        AgentResponse::new(
            json!({
                "task": call.task_id,
                "summary": format!("Result for {} from {}", call.task_id, call.agent),
                "criteria_met": criteria,
            }),
            self.tokens_per_call,
        )
    }
}

/// Decrements the in-flight count even if the call future is dropped
struct InFlight<'a> {
    state: &'a Mutex<ScriptState>,
    agent: String,
}

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        if let Some(count) = self.state.lock().in_flight.get_mut(&self.agent) {
            *count = count.saturating_sub(1);
        }
    }
}

#[async_trait]
impl AgentClient for ScriptedAgentClient {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn call(&self, agent: &AgentDescriptor, call: &AgentCall) -> Result<AgentResponse, AgentError> {
        let reply = {
            let mut state = self.state.lock();
            state.calls.push(call.clone());

            let in_flight = state.in_flight.entry(agent.id.clone()).or_insert(0);
            *in_flight += 1;
            let current = *in_flight;
            let peak = state.peak_in_flight.entry(agent.id.clone()).or_insert(0);
            *peak = (*peak).max(current);

            state
                .replies
                .get_mut(&agent.id)
                .and_then(|queue| queue.pop_front())
        };
        let _in_flight = InFlight {
            state: &self.state,
            agent: agent.id.clone(),
        };

        let latency = self
            .agent_latency
            .get(&agent.id)
            .copied()
            .unwrap_or(self.latency);
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }

        match reply {
            None => Ok(self.default_response(call, true)),
            Some(ScriptedReply::Respond(response)) => Ok(response),
            Some(ScriptedReply::Fail(error)) => Err(error),
            Some(ScriptedReply::Incomplete) => Ok(self.default_response(call, false)),
        }
    }

    async fn health_check(&self, agent: &AgentDescriptor) -> AgentHealth {
        let healthy = !self.state.lock().unhealthy.contains(&agent.id);
        AgentHealth {
            agent: agent.id.clone(),
            healthy,
            latency_ms: 0,
            detail: (!healthy).then(|| "marked unhealthy".to_string()),
        }
    }
}
