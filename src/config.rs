//! Configuration for taskweave.
//!
//! Configuration sources (highest priority first):
//! 1. Environment variables (TASKWEAVE_HOME, TASKWEAVE_AGENT_BASE_URL,
//!    TASKWEAVE_AGENT_TOKEN)
//! 2. Config file (.taskweave/config.yaml)
//! 3. Defaults (~/.taskweave)
//!
//! Config file discovery:
//! - Searches current directory and parents for .taskweave/config.yaml
//! - Paths in config file are relative to the .taskweave/ directory

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::core::ExecutorConfig;
use crate::domain::{AgentDescriptor, AgentRegistry};
use crate::resilience::ResilienceConfig;

pub const HOME_ENV: &str = "TASKWEAVE_HOME";
pub const AGENT_BASE_URL_ENV: &str = "TASKWEAVE_AGENT_BASE_URL";
pub const AGENT_TOKEN_ENV: &str = "TASKWEAVE_AGENT_TOKEN";

/// Global cached configuration (stores Result to handle init errors)
static CONFIG: OnceLock<Result<ResolvedConfig, String>> = OnceLock::new();

/// Raw config file schema (matches YAML structure)
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ConfigFile {
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub paths: PathsConfig,
    #[serde(default)]
    pub agents: AgentsConfig,
    #[serde(default)]
    pub resilience: ResilienceConfig,
    #[serde(default)]
    pub executor: ExecutorConfig,
    #[serde(default)]
    pub telemetry: TelemetryConfig,
    #[serde(default)]
    pub server: ServerConfig,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PathsConfig {
    /// Engine state directory (relative to .taskweave/)
    pub home: Option<String>,
    /// Extra workflow templates (relative to .taskweave/)
    pub templates_dir: Option<String>,
}

/// Partial override of a builtin agent
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AgentOverride {
    pub endpoint: Option<String>,
    pub max_concurrent: Option<usize>,
    pub max_tokens: Option<u64>,
    pub temperature: Option<f64>,
    pub pool: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct AgentsConfig {
    /// Base URL agents are reached at; without one the scripted client is used
    pub base_url: Option<String>,
    /// Name of the environment variable holding the bearer token
    pub token_env: Option<String>,
    #[serde(default)]
    pub overrides: BTreeMap<String, AgentOverride>,
    /// Agents in addition to the builtin ones
    #[serde(default)]
    pub extra: Vec<AgentDescriptor>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryConfig {
    /// Append every telemetry event to $TASKWEAVE_HOME/telemetry/events.jsonl
    #[serde(default = "default_true")]
    pub persist: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self { persist: true }
    }
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_bind")]
    pub bind: String,

    /// Rate limit by `X-Forwarded-For`; enable only behind a proxy that
    /// overwrites the header
    #[serde(default)]
    pub trust_forwarded_for: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            trust_forwarded_for: false,
        }
    }
}

fn default_bind() -> String {
    "127.0.0.1:8080".to_string()
}

/// Resolved configuration with absolute paths
#[derive(Debug, Clone, Serialize)]
pub struct ResolvedConfig {
    /// Absolute path to taskweave home (engine state)
    pub home: PathBuf,
    /// Directory scanned for extra workflow templates
    pub templates_dir: PathBuf,
    /// Path to config file (if found)
    pub config_file: Option<PathBuf>,
    pub agent_base_url: Option<String>,
    /// Bearer token for agent calls; never serialized
    #[serde(skip)]
    pub agent_token: Option<String>,
    pub agent_overrides: BTreeMap<String, AgentOverride>,
    pub extra_agents: Vec<AgentDescriptor>,
    pub resilience: ResilienceConfig,
    pub executor: ExecutorConfig,
    pub telemetry: TelemetryConfig,
    pub server: ServerConfig,
}

impl ResolvedConfig {
    /// Telemetry directory ($TASKWEAVE_HOME/telemetry)
    pub fn telemetry_dir(&self) -> PathBuf {
        self.home.join("telemetry")
    }

    /// Builtin agents with overrides applied, plus extra agents
    pub fn agent_registry(&self) -> AgentRegistry {
        let mut registry = AgentRegistry::builtin();

        for (id, patch) in &self.agent_overrides {
            let Some(mut agent) = registry.get(id).cloned() else {
                tracing::warn!(agent = %id, "Override for unknown agent ignored");
                continue;
            };
            if let Some(endpoint) = &patch.endpoint {
                agent.endpoint = endpoint.clone();
            }
            if let Some(max_concurrent) = patch.max_concurrent {
                agent.max_concurrent = max_concurrent;
            }
            if let Some(max_tokens) = patch.max_tokens {
                agent.max_tokens = max_tokens;
            }
            if let Some(temperature) = patch.temperature {
                agent.temperature = temperature;
            }
            if let Some(pool) = &patch.pool {
                agent.pool = pool.clone();
            }
            registry.register(agent);
        }

        for agent in &self.extra_agents {
            registry.register(agent.clone());
        }
        registry
    }
}

/// Find config file by searching current directory and parents
fn find_config_file() -> Option<PathBuf> {
    let mut current = std::env::current_dir().ok()?;

    loop {
        let config_path = current.join(".taskweave").join("config.yaml");
        if config_path.exists() {
            return Some(config_path);
        }

        if !current.pop() {
            break;
        }
    }

    None
}

/// Load and parse config file
fn load_config_file(path: &Path) -> Result<ConfigFile> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    serde_yaml::from_str(&content)
        .with_context(|| format!("Failed to parse config file: {}", path.display()))
}

/// Resolve a path that may be relative to the config file's directory
fn resolve_path(base: &Path, path_str: &str) -> PathBuf {
    let path = PathBuf::from(path_str);
    if path.is_absolute() {
        path
    } else {
        base.join(path)
            .canonicalize()
            .unwrap_or_else(|_| base.join(path_str))
    }
}

fn env_var(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

/// Merge the config file (if any) with environment overrides
fn resolve(file: ConfigFile, config_file: Option<PathBuf>, default_home: PathBuf) -> ResolvedConfig {
    let config_dir = config_file
        .as_deref()
        .and_then(Path::parent)
        .unwrap_or(Path::new("."));

    let home = if let Some(env_home) = env_var(HOME_ENV) {
        PathBuf::from(env_home)
    } else if let (Some(home_path), Some(_)) = (&file.paths.home, &config_file) {
        resolve_path(config_dir, home_path)
    } else {
        default_home
    };

    let templates_dir = match (&file.paths.templates_dir, &config_file) {
        (Some(dir), Some(_)) => resolve_path(config_dir, dir),
        _ => home.join("templates"),
    };

    let agent_base_url = env_var(AGENT_BASE_URL_ENV).or(file.agents.base_url);
    let token_env = file.agents.token_env.as_deref().unwrap_or(AGENT_TOKEN_ENV);
    let agent_token = env_var(token_env);

    ResolvedConfig {
        home,
        templates_dir,
        config_file,
        agent_base_url,
        agent_token,
        agent_overrides: file.agents.overrides,
        extra_agents: file.agents.extra,
        resilience: file.resilience,
        executor: file.executor,
        telemetry: file.telemetry,
        server: file.server,
    }
}

/// Load configuration from all sources
fn load_config() -> Result<ResolvedConfig> {
    let default_home = dirs::home_dir()
        .context("Failed to determine home directory")?
        .join(".taskweave");

    let config_file = find_config_file();
    let file = match &config_file {
        Some(path) => load_config_file(path)?,
        None => ConfigFile::default(),
    };

    Ok(resolve(file, config_file, default_home))
}

/// Get the global configuration (loads once, then cached)
pub fn config() -> Result<&'static ResolvedConfig> {
    let result = CONFIG.get_or_init(|| load_config().map_err(|e| e.to_string()));

    match result {
        Ok(config) => Ok(config),
        Err(e) => anyhow::bail!("{}", e),
    }
}

/// Force reload configuration (useful for testing)
pub fn reload_config() -> Result<ResolvedConfig> {
    load_config()
}

/// Get the taskweave home directory (engine state).
pub fn taskweave_home() -> Result<PathBuf> {
    Ok(config()?.home.clone())
}
