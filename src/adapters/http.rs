//! HTTP agent client.
//!
//! Endpoint: POST {base_url}{agent.endpoint}
//! Health:   GET  {base_url}{agent.endpoint}/health
//! Auth: optional Bearer token

use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::debug;

use super::{error_for_status, AgentCall, AgentClient, AgentError, AgentHealth, AgentResponse};
use crate::domain::AgentDescriptor;

/// Health probes give up after this long
const HEALTH_TIMEOUT: Duration = Duration::from_secs(5);

/// JSON-over-HTTP agent client
pub struct HttpAgentClient {
    base_url: String,
    token: Option<String>,
    client: reqwest::Client,
}

impl HttpAgentClient {
    /// Create a new client
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(concat!("taskweave/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("Failed to build HTTP client")?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
            client,
        })
    }

    fn url(&self, agent: &AgentDescriptor) -> String {
        format!("{}{}", self.base_url, agent.endpoint)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.header("Authorization", format!("Bearer {}", token)),
            None => request,
        }
    }

    fn transport_error(agent: &str, err: reqwest::Error) -> AgentError {
        if err.is_timeout() {
            AgentError::Timeout {
                agent: agent.to_string(),
            }
        } else {
            AgentError::Transport {
                agent: agent.to_string(),
                message: err.to_string(),
            }
        }
    }
}

#[async_trait]
impl AgentClient for HttpAgentClient {
    fn name(&self) -> &str {
        "http"
    }

    async fn call(&self, agent: &AgentDescriptor, call: &AgentCall) -> Result<AgentResponse, AgentError> {
        let url = self.url(agent);
        debug!(agent = %agent.id, task = %call.task_id, url = %url, "Calling agent");

        let request = self
            .client
            .post(&url)
            .timeout(Duration::from_millis(call.timeout_ms))
            .json(call);

        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(|e| Self::transport_error(&agent.id, e))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(error_for_status(&agent.id, status.as_u16(), body));
        }

        response
            .json::<AgentResponse>()
            .await
            .map_err(|e| AgentError::InvalidResponse {
                agent: agent.id.clone(),
                message: e.to_string(),
            })
    }

    async fn health_check(&self, agent: &AgentDescriptor) -> AgentHealth {
        let started = Instant::now();
        let request = self
            .client
            .get(format!("{}/health", self.url(agent)))
            .timeout(HEALTH_TIMEOUT);

        let (healthy, detail) = match self.authorize(request).send().await {
            Ok(response) if response.status().is_success() => (true, None),
            Ok(response) => (false, Some(format!("HTTP {}", response.status()))),
            Err(e) => (false, Some(e.to_string())),
        };

        AgentHealth {
            agent: agent.id.clone(),
            healthy,
            latency_ms: started.elapsed().as_millis() as u64,
            detail,
        }
    }
}
