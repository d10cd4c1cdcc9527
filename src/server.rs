//! HTTP surface.
//!
//! Workflow submission and planning, run status and cancellation, the
//! resilience status snapshot, manual breaker resets and agent health.
//! Every request passes through the ingress rate limiter first.

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::extract::{ConnectInfo, Path, Request, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::{info, warn};
use uuid::Uuid;

use crate::core::{CancelOutcome, PlanError, PlanMetadata, RunError, RunFailure, RunOutcome, Services};
use crate::domain::{RunConstraints, RunState, WorkflowSpec};
use crate::resilience::{RateDecision, ResilienceStatus};

/// Limiter tier for workflow submission
pub const SUBMIT_TIER: &str = "ai";
/// Limiter tier for every other route
pub const API_TIER: &str = "api";

#[derive(Clone)]
pub struct ServerState {
    pub services: Services,
    /// Key callers by `X-Forwarded-For`; only safe behind a proxy that sets it
    pub trust_forwarded_for: bool,
}

pub type ApiError = (StatusCode, Json<Value>);
pub type ApiResult<T> = std::result::Result<Json<T>, ApiError>;

pub fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (status, Json(json!({ "error": message.into() })))
}

fn plan_error(err: PlanError) -> ApiError {
    let (status, remediation) = match err {
        PlanError::UnknownWorkflowType(_) => (
            StatusCode::NOT_FOUND,
            "Use one of the registered workflow types (taskweave templates).",
        ),
        PlanError::UnknownAgent { .. } | PlanError::InvalidTemplate { .. } => (
            StatusCode::UNPROCESSABLE_ENTITY,
            "Fix the workflow template so every task names a registered agent.",
        ),
    };
    (
        status,
        Json(json!({
            "error": err.to_string(),
            "remediation": remediation,
        })),
    )
}

/// Body of `POST /v1/workflows` and `POST /v1/plans`
#[derive(Debug, Clone, Deserialize)]
pub struct SubmitRequest {
    pub goal: String,
    pub workflow_type: String,
    #[serde(default)]
    pub constraints: RunConstraints,
    #[serde(flatten)]
    pub metadata: PlanMetadata,
    /// Wait for the run to finish before responding
    #[serde(default = "default_wait")]
    pub wait: bool,
}

fn default_wait() -> bool {
    true
}

#[derive(Debug, Serialize)]
pub struct SubmitResponse {
    pub spec: WorkflowSpec,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub outcome: Option<RunOutcome>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub active_runs: usize,
}

fn failure_response(spec: WorkflowSpec, failure: RunFailure) -> ApiError {
    let status = match failure.error {
        RunError::Cancelled => StatusCode::CONFLICT,
        _ => StatusCode::UNPROCESSABLE_ENTITY,
    };
    (
        status,
        Json(json!({
            "error": {
                "kind": failure.error.kind(),
                "message": failure.error.to_string(),
                "remediation": failure.error.remediation(),
            },
            "spec": spec,
            "state": failure.state,
            "telemetry": failure.telemetry,
        })),
    )
}

fn plan(state: &ServerState, request: &SubmitRequest) -> Result<WorkflowSpec, ApiError> {
    if request.goal.trim().is_empty() {
        return Err(api_error(StatusCode::BAD_REQUEST, "goal cannot be empty"));
    }
    state
        .services
        .planner
        .create_plan(
            &request.goal,
            &request.workflow_type,
            request.constraints.clone(),
            request.metadata.clone(),
        )
        .map_err(plan_error)
}

pub async fn handle_health(State(state): State<Arc<ServerState>>) -> Json<HealthResponse> {
    let active_runs = state
        .services
        .runs
        .list()
        .iter()
        .filter(|run| run.is_running())
        .count();
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        active_runs,
    })
}

pub async fn handle_plan(
    State(state): State<Arc<ServerState>>,
    Json(request): Json<SubmitRequest>,
) -> ApiResult<WorkflowSpec> {
    Ok(Json(plan(&state, &request)?))
}

pub async fn handle_submit(
    State(state): State<Arc<ServerState>>,
    Json(request): Json<SubmitRequest>,
) -> Response {
    let spec = match plan(&state, &request) {
        Ok(spec) => spec,
        Err(err) => return err.into_response(),
    };
    info!(run_id = %spec.run_id, workflow_type = %spec.workflow_type, wait = request.wait, "Workflow submitted");

    let executor = state.services.executor.clone();
    if !request.wait {
        let handle = executor.register(&spec);
        let background = spec.clone();
        tokio::spawn(async move {
            // Outcome is delivered through the run registry and telemetry
            let _ = executor.execute(&background, handle).await;
        });
        let body = SubmitResponse { spec, outcome: None };
        return (StatusCode::ACCEPTED, Json(body)).into_response();
    }

    // Run on its own task so a client disconnect cannot drop the run midway
    let handle = executor.register(&spec);
    let background = spec.clone();
    let running = tokio::spawn(async move { executor.execute(&background, handle).await });

    match running.await {
        Ok(Ok(outcome)) => Json(SubmitResponse {
            spec,
            outcome: Some(outcome),
        })
        .into_response(),
        Ok(Err(failure)) => failure_response(spec, failure).into_response(),
        Err(e) => {
            warn!(run_id = %spec.run_id, error = %e, "Workflow task aborted");
            api_error(StatusCode::INTERNAL_SERVER_ERROR, format!("run {} aborted: {}", spec.run_id, e)).into_response()
        }
    }
}

pub async fn handle_get_run(
    State(state): State<Arc<ServerState>>,
    Path(run_id): Path<Uuid>,
) -> ApiResult<RunState> {
    state
        .services
        .runs
        .get(run_id)
        .map(Json)
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, format!("run {} not found", run_id)))
}

pub async fn handle_cancel_run(
    State(state): State<Arc<ServerState>>,
    Path(run_id): Path<Uuid>,
) -> ApiResult<Value> {
    match state.services.runs.cancel(run_id) {
        CancelOutcome::Cancelled => Ok(Json(json!({ "run_id": run_id, "status": "cancelled" }))),
        CancelOutcome::AlreadyFinished(status) => Err(api_error(
            StatusCode::CONFLICT,
            format!("run {} already {}", run_id, status.as_str()),
        )),
        CancelOutcome::NotFound => Err(api_error(StatusCode::NOT_FOUND, format!("run {} not found", run_id))),
    }
}

pub async fn handle_resilience_status(State(state): State<Arc<ServerState>>) -> Json<ResilienceStatus> {
    Json(state.services.resilience.status())
}

pub async fn handle_breaker_reset(
    State(state): State<Arc<ServerState>>,
    Path(name): Path<String>,
) -> ApiResult<Value> {
    if state.services.resilience.reset_breaker(&name) {
        info!(breaker = %name, "Breaker reset by operator");
        Ok(Json(json!({ "breaker": name, "state": "closed" })))
    } else {
        Err(api_error(StatusCode::NOT_FOUND, format!("breaker '{}' not found", name)))
    }
}

pub async fn handle_agent_health(State(state): State<Arc<ServerState>>) -> Json<Value> {
    let reports = state.services.agent_health().await;
    let healthy = reports.iter().filter(|r| r.probe.healthy).count();
    Json(json!({
        "healthy": healthy,
        "total": reports.len(),
        "agents": reports,
    }))
}

/// Limiter tier for a request
pub fn tier_for(method: &Method, path: &str) -> &'static str {
    if method == Method::POST && path == "/v1/workflows" {
        SUBMIT_TIER
    } else {
        API_TIER
    }
}

/// Identify the caller: API key, then forwarded address when the proxy is
/// trusted, then peer address
fn client_key(request: &Request, trust_forwarded_for: bool) -> String {
    let header = |name: &str| {
        request
            .headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.split(',').next())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };

    if let Some(key) = header("x-api-key") {
        return format!("key:{}", key);
    }
    if trust_forwarded_for {
        if let Some(forwarded) = header("x-forwarded-for") {
            return forwarded.to_string();
        }
    }
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|info| info.0.ip().to_string())
        .unwrap_or_else(|| "unknown".to_string())
}

/// `X-RateLimit-*` headers for a decision, plus `Retry-After` when throttled
pub fn rate_limit_headers(decision: &RateDecision) -> HeaderMap {
    let mut headers = HeaderMap::new();
    let mut put = |name: &'static str, value: String| {
        if let Ok(value) = HeaderValue::from_str(&value) {
            headers.insert(HeaderName::from_static(name), value);
        }
    };
    put("x-ratelimit-limit", decision.limit().to_string());
    put("x-ratelimit-remaining", decision.remaining().to_string());
    put("x-ratelimit-reset", decision.reset_at().to_rfc3339());
    if let RateDecision::Throttled { retry_after_ms, .. } = decision {
        put("retry-after", retry_after_ms.div_ceil(1000).to_string());
    }
    headers
}

/// Ingress rate limiting
pub async fn rate_limit(State(state): State<Arc<ServerState>>, request: Request, next: Next) -> Response {
    let tier = tier_for(request.method(), request.uri().path());
    let Some(limiter) = state.services.resilience.limiter(tier) else {
        return next.run(request).await;
    };

    let key = client_key(&request, state.trust_forwarded_for);
    let decision = limiter.check(&key);
    let headers = rate_limit_headers(&decision);

    if let RateDecision::Throttled { retry_after_ms, window_ms, .. } = &decision {
        warn!(client = %key, tier, retry_after_ms, "Request throttled");
        let body = Json(json!({
            "error": "Too many requests",
            "tier": tier,
            "retry_after_ms": retry_after_ms,
            "window_ms": window_ms,
        }));
        return (StatusCode::TOO_MANY_REQUESTS, headers, body).into_response();
    }

    let mut response = next.run(request).await;
    response.headers_mut().extend(headers);
    response
}

pub fn build_router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/healthz", get(handle_health))
        .route("/v1/workflows", post(handle_submit))
        .route("/v1/plans", post(handle_plan))
        .route("/v1/runs/{id}", get(handle_get_run))
        .route("/v1/runs/{id}/cancel", post(handle_cancel_run))
        .route("/v1/resilience/status", get(handle_resilience_status))
        .route("/v1/breakers/{name}/reset", post(handle_breaker_reset))
        .route("/v1/agents/health", get(handle_agent_health))
        .layer(middleware::from_fn_with_state(state.clone(), rate_limit))
        .with_state(state)
}

pub async fn run_server(services: Services, bind: &str, trust_forwarded_for: bool) -> Result<()> {
    let addr: SocketAddr = bind
        .parse()
        .with_context(|| format!("invalid server bind address '{}'", bind))?;

    let state = Arc::new(ServerState {
        services,
        trust_forwarded_for,
    });
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .context("failed to bind server listener")?;

    info!(%addr, "Server listening");
    axum::serve(
        listener,
        build_router(state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .context("server runtime failed")
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    fn state() -> Arc<ServerState> {
        Arc::new(ServerState {
            services: Services::scripted(),
            trust_forwarded_for: false,
        })
    }

    fn request(workflow_type: &str, wait: bool) -> SubmitRequest {
        serde_json::from_value(json!({
            "goal": "Assess our founder profile",
            "workflow_type": workflow_type,
            "wait": wait,
        }))
        .unwrap()
    }

    #[test]
    fn test_submit_request_defaults() {
        let request: SubmitRequest = serde_json::from_value(json!({
            "goal": "g",
            "workflow_type": "founder-intake",
            "impact_tier": "impact",
            "priority": 3,
        }))
        .unwrap();
        assert!(request.wait);
        assert_eq!(request.metadata.priority, Some(3));
        assert_eq!(request.metadata.resource_tier, None);
        assert_eq!(request.metadata.impact_tier, crate::domain::ImpactTier::Impact);
        assert_eq!(request.constraints, RunConstraints::default());
    }

    #[test]
    fn test_submission_uses_ai_tier() {
        assert_eq!(tier_for(&Method::POST, "/v1/workflows"), SUBMIT_TIER);
        assert_eq!(tier_for(&Method::POST, "/v1/plans"), API_TIER);
        assert_eq!(tier_for(&Method::GET, "/v1/resilience/status"), API_TIER);
    }

    fn forwarded(addr: &str) -> Request {
        axum::http::Request::builder()
            .header("x-forwarded-for", addr)
            .body(axum::body::Body::empty())
            .unwrap()
    }

    #[test]
    fn test_client_key_prefers_api_key() {
        let request = axum::http::Request::builder()
            .header("x-forwarded-for", "10.1.1.1, 10.0.0.1")
            .header("x-api-key", "tenant-42")
            .body(axum::body::Body::empty())
            .unwrap();
        assert_eq!(client_key(&request, true), "key:tenant-42");

        assert_eq!(client_key(&forwarded("10.1.1.1, 10.0.0.1"), true), "10.1.1.1");

        let request = axum::http::Request::builder().body(axum::body::Body::empty()).unwrap();
        assert_eq!(client_key(&request, true), "unknown");
    }

    #[test]
    fn test_forwarded_for_ignored_without_trusted_proxy() {
        // Rotating the header must not yield a fresh limiter key
        assert_eq!(client_key(&forwarded("10.1.1.1"), false), "unknown");
        assert_eq!(client_key(&forwarded("10.9.9.9"), false), "unknown");

        let mut request = forwarded("10.1.1.1");
        request
            .extensions_mut()
            .insert(ConnectInfo(SocketAddr::from(([192, 168, 1, 7], 4000))));
        assert_eq!(client_key(&request, false), "192.168.1.7");
    }

    #[tokio::test]
    async fn test_breaker_reset_known_agent() {
        let result = handle_breaker_reset(State(state()), Path("content-writer".to_string())).await;
        assert_eq!(result.unwrap().0["state"], "closed");
    }

    #[test]
    fn test_throttled_headers() {
        let decision = RateDecision::Throttled {
            limit: 20,
            remaining: 0,
            reset_at: Utc::now(),
            retry_after_ms: 1500,
            window_ms: 60_000,
        };
        let headers = rate_limit_headers(&decision);
        assert_eq!(headers["x-ratelimit-limit"], "20");
        assert_eq!(headers["x-ratelimit-remaining"], "0");
        assert_eq!(headers["retry-after"], "2");
        assert!(headers.contains_key("x-ratelimit-reset"));
    }

    #[tokio::test]
    async fn test_submit_and_wait() {
        let state = state();
        let response = handle_submit(State(state.clone()), Json(request("founder-intake", true))).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(state.services.runs.len(), 1);
    }

    #[tokio::test]
    async fn test_unknown_workflow_type_is_404() {
        let response = handle_submit(State(state()), Json(request("no-such-flow", true))).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_breaker_reset_unknown_is_404() {
        let result = handle_breaker_reset(State(state()), Path("nobody".to_string())).await;
        assert_eq!(result.unwrap_err().0, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_cancel_finished_run_conflicts() {
        let state = state();
        let spec = plan(&state, &request("founder-intake", true)).unwrap();
        state.services.executor.run(&spec).await.unwrap();

        let result = handle_cancel_run(State(state.clone()), Path(spec.run_id)).await;
        assert_eq!(result.unwrap_err().0, StatusCode::CONFLICT);

        let run = handle_get_run(State(state), Path(spec.run_id)).await.unwrap();
        assert!(run.0.is_finished());
    }
}
