//! Agent descriptors and the static agent registry.
//!
//! An agent is an external capability invoked by a task. The orchestrator
//! only cares about its capacity, latency, cost and token characteristics.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::workflow::TaskType;

/// Cost tier of the model behind an agent
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CostTier {
    Small,
    Medium,
    Large,
}

impl CostTier {
    /// Estimated cost in USD of a single call, used when the agent does not report one
    pub fn cost_per_call(&self) -> f64 {
        match self {
            CostTier::Small => 0.005,
            CostTier::Medium => 0.02,
            CostTier::Large => 0.05,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CostTier::Small => "small",
            CostTier::Medium => "medium",
            CostTier::Large => "large",
        }
    }
}

/// Static description of a remote agent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentDescriptor {
    /// Unique agent identifier (e.g. "profile-extractor")
    pub id: String,

    /// Endpoint path, relative to the agent base URL
    #[serde(default)]
    pub endpoint: String,

    /// Kind of work the agent performs
    pub task_type: TaskType,

    /// Free-form capability tags
    #[serde(default)]
    pub capabilities: Vec<String>,

    /// Maximum concurrent calls this agent accepts
    pub max_concurrent: usize,

    /// Observed average latency in milliseconds
    pub average_latency_ms: u64,

    /// Expected success rate (0.0 - 1.0)
    pub success_rate_hint: f64,

    /// Model cost tier
    pub cost_tier: CostTier,

    /// Baseline token budget per call, before complexity scaling
    pub max_tokens: u64,

    /// Sampling temperature passed to the agent
    #[serde(default = "default_temperature")]
    pub temperature: f64,

    /// Connection pool the agent's calls run through
    #[serde(default = "default_pool")]
    pub pool: String,
}

fn default_temperature() -> f64 {
    0.5
}

fn default_pool() -> String {
    "ai".to_string()
}

impl AgentDescriptor {
    #[allow(clippy::too_many_arguments)]
    fn builtin(
        id: &str,
        task_type: TaskType,
        capabilities: &[&str],
        max_concurrent: usize,
        average_latency_ms: u64,
        success_rate_hint: f64,
        cost_tier: CostTier,
        max_tokens: u64,
        temperature: f64,
    ) -> Self {
        Self {
            id: id.to_string(),
            endpoint: format!("/api/agents/{}", id),
            task_type,
            capabilities: capabilities.iter().map(|c| c.to_string()).collect(),
            max_concurrent,
            average_latency_ms,
            success_rate_hint,
            cost_tier,
            max_tokens,
            temperature,
            pool: default_pool(),
        }
    }
}

/// Read-only registry of known agents
#[derive(Debug, Clone, Default)]
pub struct AgentRegistry {
    agents: BTreeMap<String, AgentDescriptor>,
}

impl AgentRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry populated with the built-in agents
    pub fn builtin() -> Self {
        use CostTier::*;
        use TaskType::*;

        let mut registry = Self::new();
        for agent in [
            AgentDescriptor::builtin("profile-extractor", Research, &["information_extraction", "profile_building", "context_analysis"], 5, 2000, 0.95, Medium, 4000, 0.3),
            AgentDescriptor::builtin("needs-analyzer", Research, &["needs_assessment", "urgency_detection", "gap_analysis"], 3, 3000, 0.92, Medium, 6000, 0.2),
            AgentDescriptor::builtin("resource-searcher", Research, &["database_search", "web_search", "resource_matching"], 10, 1500, 0.98, Small, 2000, 0.1),
            AgentDescriptor::builtin("match-evaluator", Evaluation, &["scoring", "ranking", "fit_assessment"], 4, 2500, 0.94, Medium, 4000, 0.1),
            AgentDescriptor::builtin("response-writer", Writing, &["content_generation", "personalization", "action_planning"], 2, 4000, 0.96, Large, 8000, 0.7),
            AgentDescriptor::builtin("grant-profile-extractor", Research, &["grant_analysis", "eligibility_checking", "requirement_mapping"], 3, 3000, 0.93, Medium, 6000, 0.2),
            AgentDescriptor::builtin("grant-searcher", Research, &["grant_database_search", "deadline_tracking", "eligibility_filtering"], 8, 2000, 0.97, Small, 3000, 0.1),
            AgentDescriptor::builtin("grant-scorer", Evaluation, &["grant_scoring", "success_probability", "fit_analysis"], 5, 2500, 0.95, Medium, 4000, 0.1),
            AgentDescriptor::builtin("grant-prioritizer", Evaluation, &["prioritization", "timeline_planning", "strategic_ranking"], 2, 2000, 0.96, Medium, 4000, 0.2),
            AgentDescriptor::builtin("application-preparer", Writing, &["proposal_writing", "document_preparation", "customization"], 1, 6000, 0.94, Large, 10000, 0.6),
            AgentDescriptor::builtin("request-analyzer", Research, &["intent_detection", "context_extraction", "query_parsing"], 6, 1000, 0.98, Small, 2000, 0.1),
            AgentDescriptor::builtin("knowledge-searcher", Research, &["knowledge_base_search", "resource_discovery", "content_filtering"], 8, 1500, 0.97, Small, 3000, 0.1),
            AgentDescriptor::builtin("recommendation-synthesizer", Writing, &["synthesis", "recommendation_generation", "explanation_writing"], 3, 3000, 0.95, Medium, 6000, 0.5),
            AgentDescriptor::builtin("impact-evaluator", Evaluation, &["impact_scoring", "equity_analysis"], 2, 3500, 0.91, Medium, 4000, 0.2),
            AgentDescriptor::builtin("equity-checker", Evaluation, &["bias_detection", "equity_adjustment"], 2, 3000, 0.89, Medium, 4000, 0.2),
        ] {
            registry.register(agent);
        }
        registry
    }

    /// Add or replace an agent
    pub fn register(&mut self, agent: AgentDescriptor) {
        self.agents.insert(agent.id.clone(), agent);
    }

    pub fn get(&self, id: &str) -> Option<&AgentDescriptor> {
        self.agents.get(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.agents.contains_key(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &AgentDescriptor> {
        self.agents.values()
    }

    pub fn len(&self) -> usize {
        self.agents.len()
    }

    pub fn is_empty(&self) -> bool {
        self.agents.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_registry() {
        let registry = AgentRegistry::builtin();
        assert_eq!(registry.len(), 15);

        let writer = registry.get("response-writer").unwrap();
        assert_eq!(writer.max_concurrent, 2);
        assert_eq!(writer.cost_tier, CostTier::Large);
        assert_eq!(writer.endpoint, "/api/agents/response-writer");
        assert_eq!(writer.pool, "ai");
    }

    #[test]
    fn test_cost_tiers() {
        assert_eq!(CostTier::Small.cost_per_call(), 0.005);
        assert_eq!(CostTier::Large.as_str(), "large");
    }

    #[test]
    fn test_register_overrides() {
        let mut registry = AgentRegistry::builtin();
        let mut agent = registry.get("grant-searcher").unwrap().clone();
        agent.max_concurrent = 1;
        registry.register(agent);

        assert_eq!(registry.get("grant-searcher").unwrap().max_concurrent, 1);
        assert_eq!(registry.len(), 15);
    }
}
