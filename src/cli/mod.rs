//! Command-line interface for taskweave.
//!
//! Provides commands for planning and running workflows, inspecting
//! templates and agents, serving the HTTP API, and reading telemetry.

use std::collections::BTreeMap;
use std::io::{self, IsTerminal, Read};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand, ValueEnum};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::adapters::{AgentClient, HttpAgentClient, ScriptedAgentClient};
use crate::config::{self, ResolvedConfig};
use crate::core::{PlanMetadata, ResourceTier, Services, TelemetryStore, TemplateRegistry, Urgency};
use crate::domain::{ImpactTier, RunConstraints, TelemetryEvent, WorkflowSpec};

/// taskweave - Task-graph workflow orchestrator
#[derive(Parser, Debug)]
#[command(name = "taskweave")]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Plan and run a workflow
    Run {
        #[command(flatten)]
        plan: PlanArgs,

        /// Use the deterministic scripted agent client instead of real agents
        #[arg(long)]
        dry_run: bool,

        /// Print the full outcome as JSON
        #[arg(long)]
        json: bool,
    },

    /// Plan a workflow without running it
    Plan {
        #[command(flatten)]
        plan: PlanArgs,

        /// Print the spec as JSON
        #[arg(long)]
        json: bool,
    },

    /// List registered workflow templates
    Templates,

    /// List registered agents
    Agents {
        /// Probe every agent's health endpoint
        #[arg(long)]
        health: bool,
    },

    /// Start the HTTP server
    Serve {
        /// Address to bind to (defaults to the configured server.bind)
        #[arg(short, long, env = "TASKWEAVE_BIND")]
        bind: Option<String>,

        /// Use the scripted agent client
        #[arg(long)]
        dry_run: bool,
    },

    /// Show resolved configuration (debug)
    Config,

    /// Show persisted telemetry
    Telemetry {
        /// Maximum number of run reports to show
        #[arg(short, long, default_value = "10")]
        limit: usize,

        /// Also list breaker transitions
        #[arg(long)]
        breakers: bool,
    },
}

/// Planning inputs shared by `run` and `plan`
#[derive(Args, Debug, Clone)]
pub struct PlanArgs {
    /// Workflow type (see `taskweave templates`)
    pub workflow_type: String,

    /// Goal text (reads from stdin if not provided)
    pub goal: Option<String>,

    /// Add impact evaluation tasks and criteria
    #[arg(long)]
    pub impact: bool,

    #[arg(long, value_enum, default_value = "normal")]
    pub urgency: UrgencyArg,

    /// Resource tier (defaults to impact with --impact, else commercial)
    #[arg(long, value_enum)]
    pub tier: Option<TierArg>,

    /// Override the tier's priority; above 2 every task runs sequentially
    #[arg(long)]
    pub priority: Option<u32>,

    /// Token budget for the run
    #[arg(long)]
    pub max_tokens: Option<u64>,

    /// Cost budget for the run in USD
    #[arg(long)]
    pub max_cost: Option<f64>,

    /// Soft latency target in milliseconds
    #[arg(long)]
    pub target_latency_ms: Option<u64>,

    /// Extra impact constraints (comma-separated)
    #[arg(long, value_delimiter = ',')]
    pub constraints: Vec<String>,

    /// Seed input values as key=value
    #[arg(short, long = "context", value_parser = parse_key_value)]
    pub context: Vec<(String, String)>,
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum UrgencyArg {
    Low,
    Normal,
    High,
}

impl From<UrgencyArg> for Urgency {
    fn from(u: UrgencyArg) -> Self {
        match u {
            UrgencyArg::Low => Urgency::Low,
            UrgencyArg::Normal => Urgency::Normal,
            UrgencyArg::High => Urgency::High,
        }
    }
}

#[derive(Debug, Clone, Copy, ValueEnum)]
pub enum TierArg {
    Impact,
    Commercial,
    Free,
    Internal,
}

impl From<TierArg> for ResourceTier {
    fn from(t: TierArg) -> Self {
        match t {
            TierArg::Impact => ResourceTier::Impact,
            TierArg::Commercial => ResourceTier::Commercial,
            TierArg::Free => ResourceTier::Free,
            TierArg::Internal => ResourceTier::Internal,
        }
    }
}

fn parse_key_value(s: &str) -> std::result::Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected key=value, got '{}'", s))?;
    if key.trim().is_empty() {
        return Err(format!("empty key in '{}'", s));
    }
    Ok((key.trim().to_string(), value.to_string()))
}

impl PlanArgs {
    fn goal(&self) -> Result<String> {
        let goal = if let Some(goal) = &self.goal {
            goal.clone()
        } else if !io::stdin().is_terminal() {
            let mut buffer = String::new();
            io::stdin()
                .read_to_string(&mut buffer)
                .context("Failed to read goal from stdin")?;
            buffer
        } else {
            anyhow::bail!("No goal provided. Pass it as an argument or pipe it to stdin");
        };

        let goal = goal.trim().to_string();
        if goal.is_empty() {
            anyhow::bail!("Goal is empty");
        }
        Ok(goal)
    }

    fn constraints(&self) -> RunConstraints {
        RunConstraints {
            max_tokens: self.max_tokens,
            max_cost: self.max_cost,
            target_latency_ms: self.target_latency_ms,
        }
    }

    fn metadata(&self) -> PlanMetadata {
        PlanMetadata {
            impact_tier: if self.impact {
                ImpactTier::Impact
            } else {
                ImpactTier::Standard
            },
            urgency: self.urgency.into(),
            resource_tier: self.tier.map(Into::into),
            priority: self.priority,
            tenant_constraints: self.constraints.clone(),
            context: self
                .context
                .iter()
                .map(|(k, v)| (k.clone(), serde_json::Value::String(v.clone())))
                .collect::<BTreeMap<_, _>>(),
        }
    }
}

impl Cli {
    /// Execute the CLI command
    pub async fn execute(self) -> Result<()> {
        match self.command {
            Commands::Run { plan, dry_run, json } => run_workflow(&plan, dry_run, json).await,
            Commands::Plan { plan, json } => plan_workflow(&plan, json).await,
            Commands::Templates => list_templates().await,
            Commands::Agents { health } => list_agents(health).await,
            Commands::Serve { bind, dry_run } => serve(bind, dry_run).await,
            Commands::Config => show_config().await,
            Commands::Telemetry { limit, breakers } => show_telemetry(limit, breakers).await,
        }
    }
}

/// Builtin templates plus those in the configured templates directory
fn load_templates(cfg: &ResolvedConfig) -> Result<TemplateRegistry> {
    let agents = cfg.agent_registry();
    let mut templates = TemplateRegistry::builtin();
    let loaded = templates
        .load_dir(&cfg.templates_dir, &agents)
        .with_context(|| format!("Failed to load templates from {}", cfg.templates_dir.display()))?;
    if loaded > 0 {
        info!(loaded, dir = %cfg.templates_dir.display(), "Loaded workflow templates");
    }
    Ok(templates)
}

/// Build the service graph from configuration
fn build_services(cfg: &ResolvedConfig, dry_run: bool) -> Result<Services> {
    let client: Arc<dyn AgentClient> = match (&cfg.agent_base_url, dry_run) {
        (Some(base_url), false) => Arc::new(HttpAgentClient::new(base_url.clone(), cfg.agent_token.clone())?),
        (None, false) => {
            warn!(
                "No agent base URL configured ({}); using the scripted client",
                config::AGENT_BASE_URL_ENV
            );
            Arc::new(ScriptedAgentClient::new())
        }
        (_, true) => Arc::new(ScriptedAgentClient::new()),
    };

    Ok(Services::builder(load_templates(cfg)?, cfg.agent_registry())
        .client(client)
        .resilience(cfg.resilience.clone())
        .executor(cfg.executor.clone())
        .build())
}

/// Persist the telemetry stream if configured
async fn start_recorder(cfg: &ResolvedConfig, services: &Services) -> Result<Option<JoinHandle<()>>> {
    if !cfg.telemetry.persist {
        return Ok(None);
    }
    let store = TelemetryStore::open(cfg.telemetry_dir()).await?;
    Ok(Some(store.spawn_recorder(&services.telemetry)))
}

fn plan(services: &Services, args: &PlanArgs) -> Result<WorkflowSpec> {
    let goal = args.goal()?;
    let spec = services
        .planner
        .create_plan(&goal, &args.workflow_type, args.constraints(), args.metadata())?;
    Ok(spec)
}

fn print_spec(spec: &WorkflowSpec) {
    println!("Run ID:        {}", spec.run_id);
    println!("Workflow:      {} ({:?})", spec.workflow_type, spec.impact_tier);
    println!("Estimated:     {}ms", spec.estimated_duration_ms);
    println!();
    println!("{:<28} {:<26} {:<10} {:<8} INPUTS", "TASK", "AGENT", "PARALLEL", "TOKENS");
    println!("{}", "-".repeat(90));
    for task in &spec.tasks {
        println!(
            "{:<28} {:<26} {:<10} {:<8} {}",
            task.id,
            task.agent,
            task.parallel,
            task.max_tokens,
            task.inputs.join(", ")
        );
    }
}

/// Plan a workflow and print the spec
async fn plan_workflow(args: &PlanArgs, json: bool) -> Result<()> {
    let cfg = config::config()?;
    let services = build_services(cfg, true)?;
    let spec = plan(&services, args)?;

    if json {
        println!("{}", serde_json::to_string_pretty(&spec)?);
    } else {
        print_spec(&spec);
    }
    Ok(())
}

/// Plan and run a workflow
async fn run_workflow(args: &PlanArgs, dry_run: bool, json: bool) -> Result<()> {
    let cfg = config::config()?;
    let services = build_services(cfg, dry_run)?;
    let recorder = start_recorder(cfg, &services).await?;
    let spec = plan(&services, args)?;

    let result = services.executor.run(&spec).await;

    // Dropping the services closes the telemetry stream so the recorder drains and exits
    drop(services);
    if let Some(recorder) = recorder {
        if let Err(e) = recorder.await {
            warn!(error = %e, "Telemetry recorder stopped abnormally");
        }
    }

    match result {
        Ok(outcome) => {
            if json {
                println!("{}", serde_json::to_string_pretty(&outcome)?);
            } else {
                for (task_id, result) in &outcome.results {
                    println!("## {} ({})", task_id, result.agent);
                    println!("{}", serde_json::to_string_pretty(&result.content)?);
                    println!();
                }
            }
            eprintln!(
                "\n[Run {} completed: {} tasks, {} tokens, ${:.4}, {}ms]",
                outcome.run_id,
                outcome.metrics.completed_tasks,
                outcome.metrics.tokens_used,
                outcome.metrics.cost_incurred,
                outcome.metrics.total_duration_ms
            );
            Ok(())
        }
        Err(failure) => {
            if json {
                println!("{}", serde_json::to_string_pretty(&failure.state)?);
            }
            eprintln!("\n[Run {} {}: {}]", failure.state.run_id, failure.state.status.as_str(), failure.error);
            eprintln!("Remediation: {}", failure.error.remediation());
            eprintln!(
                "Completed {}/{} tasks before stopping",
                failure.state.metrics.completed_tasks, failure.state.metrics.total_tasks
            );
            std::process::exit(1);
        }
    }
}

/// List workflow templates
async fn list_templates() -> Result<()> {
    let cfg = config::config()?;
    let templates = load_templates(cfg)?;

    println!("{:<28} {:<6} DESCRIPTION", "NAME", "TASKS");
    println!("{}", "-".repeat(80));
    for template in templates.iter() {
        println!("{:<28} {:<6} {}", template.name, template.tasks.len(), template.description);
    }
    Ok(())
}

/// List agents, optionally probing their health
async fn list_agents(health: bool) -> Result<()> {
    let cfg = config::config()?;

    if health {
        let services = build_services(cfg, false)?;
        println!("{:<26} {:<8} {:<10} {:<10} DETAIL", "AGENT", "HEALTHY", "LATENCY", "BREAKER");
        println!("{}", "-".repeat(80));
        for report in services.agent_health().await {
            println!(
                "{:<26} {:<8} {:<10} {:<10} {}",
                report.probe.agent,
                report.probe.healthy,
                format!("{}ms", report.probe.latency_ms),
                report.breaker,
                report.probe.detail.unwrap_or_default()
            );
        }
        return Ok(());
    }

    let agents = cfg.agent_registry();
    println!(
        "{:<26} {:<10} {:<8} {:<8} {:<8} POOL",
        "AGENT", "TYPE", "MAX", "TOKENS", "TIER"
    );
    println!("{}", "-".repeat(80));
    for agent in agents.iter() {
        println!(
            "{:<26} {:<10} {:<8} {:<8} {:<8} {}",
            agent.id,
            format!("{:?}", agent.task_type).to_lowercase(),
            agent.max_concurrent,
            agent.max_tokens,
            agent.cost_tier.as_str(),
            agent.pool
        );
    }
    Ok(())
}

/// Start the HTTP server
async fn serve(bind: Option<String>, dry_run: bool) -> Result<()> {
    let cfg = config::config()?;
    let services = build_services(cfg, dry_run)?;
    let _recorder = start_recorder(cfg, &services).await?;
    let _housekeeping = services.spawn_housekeeping(Duration::from_secs(60));

    let bind = bind.unwrap_or_else(|| cfg.server.bind.clone());
    crate::server::run_server(services, &bind, cfg.server.trust_forwarded_for).await
}

/// Show resolved configuration
async fn show_config() -> Result<()> {
    let cfg = config::config()?;

    println!("taskweave configuration");
    println!();
    println!(
        "Config file: {}",
        cfg.config_file
            .as_ref()
            .map(|p| p.display().to_string())
            .unwrap_or_else(|| "(none - using defaults)".to_string())
    );
    println!();
    println!("Paths:");
    println!("  Home (engine state): {}", cfg.home.display());
    println!("  Templates:           {}", cfg.templates_dir.display());
    println!("  Telemetry:           {}", cfg.telemetry_dir().display());
    println!();
    println!("Agents:");
    println!(
        "  Base URL: {}",
        cfg.agent_base_url.as_deref().unwrap_or("(none - scripted client)")
    );
    println!("  Token:    {}", if cfg.agent_token.is_some() { "set" } else { "not set" });
    println!("  Overrides: {}", cfg.agent_overrides.len());
    println!("  Extra agents: {}", cfg.extra_agents.len());
    println!();
    println!("Executor:");
    println!("  Run retention:        {}s", cfg.executor.retention_secs);
    println!("  Default task timeout: {}ms", cfg.executor.default_task_timeout_ms);
    println!("  Max attempts:         {}", cfg.executor.retry.max_attempts);
    println!("  Jitter:               {}", cfg.executor.retry.jitter);
    println!();
    println!("Resilience:");
    println!(
        "  Breaker defaults: threshold {}, reset {}ms, half-open calls {}",
        cfg.resilience.breaker.failure_threshold,
        cfg.resilience.breaker.reset_timeout_ms,
        cfg.resilience.breaker.half_open_max_calls
    );
    println!("  Breaker overrides: {}", cfg.resilience.breakers.len());
    println!("  Pool overrides:    {}", cfg.resilience.pools.len());
    println!("  Cache overrides:   {}", cfg.resilience.caches.len());
    println!("  Limiter overrides: {}", cfg.resilience.rate_limits.len());
    println!();
    println!("Telemetry persist: {}", cfg.telemetry.persist);
    println!("Server bind:       {}", cfg.server.bind);

    Ok(())
}

/// Print persisted run reports and breaker transitions
async fn show_telemetry(limit: usize, breakers: bool) -> Result<()> {
    let cfg = config::config()?;
    let store = TelemetryStore::open(cfg.telemetry_dir()).await?;
    let events = store.replay().await?;

    let reports: Vec<_> = events
        .iter()
        .filter_map(|e| match e {
            TelemetryEvent::RunReport(report) => Some(report),
            TelemetryEvent::BreakerTransition(_) | TelemetryEvent::LatencyOverrun(_) => None,
        })
        .collect();

    if reports.is_empty() {
        println!("No run reports found in {}", store.events_path().display());
    } else {
        println!(
            "{:<38} {:<24} {:<10} {:<8} {:<8} ERROR",
            "RUN ID", "WORKFLOW", "STATUS", "TASKS", "TOKENS"
        );
        println!("{}", "-".repeat(110));
        for report in reports.iter().rev().take(limit) {
            println!(
                "{:<38} {:<24} {:<10} {:<8} {:<8} {}",
                report.run_id,
                report.workflow_type,
                report.status.as_str(),
                format!("{}/{}", report.metrics.completed_tasks, report.metrics.total_tasks),
                report.metrics.tokens_used,
                report
                    .outcome
                    .error
                    .as_ref()
                    .map(|e| e.message.as_str())
                    .unwrap_or("")
            );
        }
    }

    if breakers {
        println!();
        println!("{:<30} {:<10} {:<10} TIMESTAMP", "BREAKER", "FROM", "TO");
        println!("{}", "-".repeat(80));
        for event in &events {
            if let TelemetryEvent::BreakerTransition(t) = event {
                println!("{:<30} {:<10} {:<10} {}", t.breaker, t.from, t.to, t.timestamp);
            }
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_key_value() {
        assert_eq!(
            parse_key_value("stage=seed").unwrap(),
            ("stage".to_string(), "seed".to_string())
        );
        assert_eq!(
            parse_key_value("note=a=b").unwrap(),
            ("note".to_string(), "a=b".to_string())
        );
        assert!(parse_key_value("novalue").is_err());
        assert!(parse_key_value("=x").is_err());
    }

    #[test]
    fn test_run_args() {
        let cli = Cli::try_parse_from([
            "taskweave",
            "run",
            "founder-intake",
            "Find seed funding",
            "--impact",
            "--tier",
            "free",
            "--priority",
            "3",
            "--max-tokens",
            "9000",
            "-c",
            "stage=seed",
            "--dry-run",
        ])
        .unwrap();

        let Commands::Run { plan, dry_run, .. } = cli.command else {
            panic!("expected run command");
        };
        assert!(dry_run);
        let metadata = plan.metadata();
        assert_eq!(metadata.impact_tier, ImpactTier::Impact);
        assert_eq!(metadata.resource_tier, Some(ResourceTier::Free));
        assert_eq!(metadata.priority, Some(3));
        assert_eq!(metadata.context["stage"], serde_json::json!("seed"));
        assert_eq!(plan.constraints().max_tokens, Some(9000));
        assert_eq!(plan.goal().unwrap(), "Find seed funding");
    }
}
