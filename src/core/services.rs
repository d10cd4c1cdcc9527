//! Process-wide service graph.
//!
//! Everything with shared state is constructed once here and handed out by
//! `Arc`: the agent registry, planner, resilience primitives, telemetry
//! stream, run registry and executor.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::executor::{AgentCallMetrics, Executor, ExecutorConfig};
use super::planner::Planner;
use super::runs::RunRegistry;
use super::telemetry::TelemetrySink;
use super::templates::TemplateRegistry;
use super::validator::{AcceptanceValidator, SubstringValidator};
use crate::adapters::{AgentClient, AgentHealth, ScriptedAgentClient};
use crate::domain::AgentRegistry;
use crate::resilience::{BreakerState, Resilience, ResilienceConfig};

/// Cache holding agent health probes
pub const HEALTH_CACHE: &str = "health";

/// Health of one agent as seen by this process
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentHealthReport {
    #[serde(flatten)]
    pub probe: AgentHealth,
    pub breaker: BreakerState,
    pub calls: AgentCallMetrics,
}

/// Shared services, built once at start-up
#[derive(Clone)]
pub struct Services {
    pub agents: Arc<AgentRegistry>,
    pub planner: Arc<Planner>,
    pub resilience: Arc<Resilience>,
    pub telemetry: TelemetrySink,
    pub runs: Arc<RunRegistry>,
    pub client: Arc<dyn AgentClient>,
    pub executor: Executor,
}

pub struct ServicesBuilder {
    templates: TemplateRegistry,
    agents: AgentRegistry,
    client: Option<Arc<dyn AgentClient>>,
    validator: Arc<dyn AcceptanceValidator>,
    resilience: ResilienceConfig,
    executor: ExecutorConfig,
}

impl ServicesBuilder {
    /// Agent client; defaults to the scripted client
    pub fn client(mut self, client: Arc<dyn AgentClient>) -> Self {
        self.client = Some(client);
        self
    }

    pub fn validator(mut self, validator: Arc<dyn AcceptanceValidator>) -> Self {
        self.validator = validator;
        self
    }

    pub fn resilience(mut self, config: ResilienceConfig) -> Self {
        self.resilience = config;
        self
    }

    pub fn executor(mut self, config: ExecutorConfig) -> Self {
        self.executor = config;
        self
    }

    pub fn build(self) -> Services {
        let telemetry = TelemetrySink::new();
        let resilience = Arc::new(Resilience::with_listener(
            &self.resilience,
            telemetry.transition_listener(),
        ));
        let agents = Arc::new(self.agents.clone());
        // One breaker per agent up front so operators can reset any of them
        for agent in agents.iter() {
            resilience.breaker(&agent.id);
        }
        let planner = Arc::new(Planner::new(self.templates, self.agents));
        let runs = Arc::new(RunRegistry::new(self.executor.retention()));
        let client: Arc<dyn AgentClient> = match self.client {
            Some(client) => client,
            None => Arc::new(ScriptedAgentClient::new()),
        };

        let executor = Executor::new(
            agents.clone(),
            client.clone(),
            self.validator,
            resilience.clone(),
            runs.clone(),
            telemetry.clone(),
            self.executor,
        );

        debug!(
            agents = agents.len(),
            templates = planner.templates().len(),
            client = client.name(),
            "Services ready"
        );

        Services {
            agents,
            planner,
            resilience,
            telemetry,
            runs,
            client,
            executor,
        }
    }
}

impl Services {
    pub fn builder(templates: TemplateRegistry, agents: AgentRegistry) -> ServicesBuilder {
        ServicesBuilder {
            templates,
            agents,
            client: None,
            validator: Arc::new(SubstringValidator),
            resilience: ResilienceConfig::default(),
            executor: ExecutorConfig::default(),
        }
    }

    /// Builtin templates and agents with the scripted client
    pub fn scripted() -> Self {
        Self::builder(TemplateRegistry::builtin(), AgentRegistry::builtin()).build()
    }

    /// Probe every agent. Probes are cached in the health cache and run
    /// concurrently.
    pub async fn agent_health(&self) -> Vec<AgentHealthReport> {
        let cache = self.resilience.cache(HEALTH_CACHE);
        let mut probes = Vec::new();

        for agent in self.agents.iter() {
            if let Some(cached) = cache.get(&agent.id) {
                match serde_json::from_value::<AgentHealth>(cached) {
                    Ok(health) => {
                        probes.push((agent.id.clone(), None, Some(health)));
                        continue;
                    }
                    Err(e) => warn!(agent = %agent.id, error = %e, "Discarding cached health probe"),
                }
            }

            let client = self.client.clone();
            let agent = agent.clone();
            let id = agent.id.clone();
            let probe = tokio::spawn(async move { client.health_check(&agent).await });
            probes.push((id, Some(probe), None));
        }

        let metrics = self.executor.agent_metrics();
        let mut reports = Vec::with_capacity(probes.len());
        for (id, pending, cached) in probes {
            let probe = match (pending, cached) {
                (_, Some(health)) => health,
                (Some(handle), None) => {
                    let health = match handle.await {
                        Ok(health) => health,
                        Err(e) => AgentHealth {
                            agent: id.clone(),
                            healthy: false,
                            latency_ms: 0,
                            detail: Some(format!("health probe aborted: {}", e)),
                        },
                    };
                    if let Ok(value) = serde_json::to_value(&health) {
                        cache.set(id.clone(), value, None);
                    }
                    health
                }
                (None, None) => continue,
            };

            reports.push(AgentHealthReport {
                probe,
                breaker: self.resilience.breaker(&id).state(),
                calls: metrics.get(&id).cloned().unwrap_or_default(),
            });
        }
        reports
    }

    /// Drop expired rate limiter windows and finished runs on an interval
    pub fn spawn_housekeeping(&self, every: Duration) -> tokio::task::JoinHandle<()> {
        let resilience = self.resilience.clone();
        let runs = self.runs.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                ticker.tick().await;
                let windows = resilience.cleanup_limiters();
                let purged = runs.purge();
                if windows + purged > 0 {
                    debug!(windows, purged, "Housekeeping");
                }
            }
        })
    }

    /// Agent call metrics keyed by agent id
    pub fn agent_metrics(&self) -> BTreeMap<String, AgentCallMetrics> {
        self.executor.agent_metrics()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_agent_health_reports_every_agent() {
        let client = Arc::new(ScriptedAgentClient::new());
        client.mark_unhealthy("content-writer");

        let services = Services::builder(TemplateRegistry::builtin(), AgentRegistry::builtin())
            .client(client)
            .build();

        let reports = services.agent_health().await;
        assert_eq!(reports.len(), services.agents.len());

        let writer = reports
            .iter()
            .find(|r| r.probe.agent == "content-writer")
            .unwrap();
        assert!(!writer.probe.healthy);
        assert_eq!(writer.breaker, BreakerState::Closed);

        // Second call is served from the health cache
        services.agent_health().await;
        let health_cache = services.resilience.cache(HEALTH_CACHE).metrics();
        assert_eq!(health_cache.hits as usize, services.agents.len());
    }

    #[test]
    fn test_every_agent_has_a_breaker() {
        let services = Services::scripted();

        let statuses = services.resilience.breakers().statuses();
        assert_eq!(statuses.len(), services.agents.len());
        assert!(statuses.contains_key("grant-searcher"));
        assert!(services.resilience.reset_breaker("grant-searcher"));
    }
}
