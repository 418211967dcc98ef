//! HTTP API for probes, Prometheus metrics and manual scaling

use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use prometheus::{Encoder, TextEncoder};
use scheduler_lib::{
    client::DeploymentClient,
    health::{Component, ComponentStatus, HealthRegistry},
    observability::{SchedulerMetrics, StructuredLogger},
    toggle::{toggle_once, ToggleOutcome},
    workload::{ScaleState, WorkloadKey},
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tracing::{debug, error, info, warn};

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub health_registry: HealthRegistry,
    pub metrics: SchedulerMetrics,
    pub logger: StructuredLogger,
    pub client: Arc<dyn DeploymentClient>,
}

impl AppState {
    pub fn new(
        health_registry: HealthRegistry,
        metrics: SchedulerMetrics,
        logger: StructuredLogger,
        client: Arc<dyn DeploymentClient>,
    ) -> Self {
        Self {
            health_registry,
            metrics,
            logger,
            client,
        }
    }
}

/// Body of `/scaleDown` and `/scaleUp`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScaleRequest {
    pub namespace: String,
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScaleResponse {
    pub namespace: String,
    pub name: String,
    pub action: String,
    pub outcome: ToggleOutcome,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: String,
}

fn error_response(status: StatusCode, error: impl Into<String>) -> Response {
    (status, Json(ErrorBody { error: error.into() })).into_response()
}

async fn version() -> &'static str {
    VERSION
}

/// 200 unless a component is unhealthy
async fn liveness(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.health_registry.report().await;
    if health.status.is_operational() {
        (StatusCode::OK, "OK")
    } else {
        (StatusCode::SERVICE_UNAVAILABLE, "NOT OK")
    }
}

/// Health check response - returns 200 if healthy or degraded, 503 if unhealthy
async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.health_registry.report().await;

    let status_code = match health.status {
        ComponentStatus::Healthy | ComponentStatus::Degraded => StatusCode::OK,
        ComponentStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (status_code, Json(health))
}

async fn readiness(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    match state.health_registry.not_ready_reason().await {
        None => (StatusCode::OK, "OK"),
        Some(reason) => {
            debug!(reason = %reason, "Not ready");
            (StatusCode::SERVICE_UNAVAILABLE, "NOT OK")
        }
    }
}

async fn mark_ready(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    info!("Readiness gate opened by operator");
    state.health_registry.open().await;
    readiness(State(state)).await
}

async fn mark_not_ready(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    info!("Readiness gate held by operator");
    state.health_registry.hold("marked not ready by operator").await;
    readiness(State(state)).await
}

/// Prometheus metrics endpoint
async fn metrics() -> Response {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        error!(error = %e, "Failed to encode metrics");
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
    }

    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        buffer,
    )
        .into_response()
}

async fn scale_down(
    State(state): State<Arc<AppState>>,
    body: Result<Json<ScaleRequest>, JsonRejection>,
) -> Response {
    scale(state, body, ScaleState::Suspended).await
}

async fn scale_up(
    State(state): State<Arc<AppState>>,
    body: Result<Json<ScaleRequest>, JsonRejection>,
) -> Response {
    scale(state, body, ScaleState::Running).await
}

async fn scale(
    state: Arc<AppState>,
    body: Result<Json<ScaleRequest>, JsonRejection>,
    target: ScaleState,
) -> Response {
    let request = match body {
        Ok(Json(request)) => request,
        Err(rejection) => {
            warn!(error = %rejection, "Rejected scale request");
            return error_response(StatusCode::BAD_REQUEST, rejection.body_text());
        }
    };
    if request.namespace.is_empty() || request.name.is_empty() {
        return error_response(StatusCode::BAD_REQUEST, "namespace and name are required");
    }

    let action = match target {
        ScaleState::Suspended => "scaleDown",
        ScaleState::Running => "scaleUp",
    };
    let key = WorkloadKey::new(&request.namespace, &request.name);
    info!(namespace = %request.namespace, name = %request.name, action, "Manual scale requested");

    match toggle_once(state.client.as_ref(), &key, target).await {
        Ok(outcome) => {
            match &outcome {
                ToggleOutcome::Suspended { remembered } => {
                    state.metrics.inc_toggle("suspend");
                    state.logger.log_suspended(&key, *remembered, "api");
                }
                ToggleOutcome::Resumed { replicas } => {
                    state.metrics.inc_toggle("resume");
                    state.logger.log_resumed(&key, *replicas, "api");
                }
                _ => {}
            }
            (
                StatusCode::OK,
                Json(ScaleResponse {
                    namespace: request.namespace,
                    name: request.name,
                    action: action.to_string(),
                    outcome,
                }),
            )
                .into_response()
        }
        Err(e) => {
            error!(namespace = %request.namespace, name = %request.name, action, error = %e, "Manual scale failed");
            state.metrics.inc_toggle_errors();
            error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
        }
    }
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/version", get(version))
        .route("/liveness", get(liveness))
        .route("/healthz", get(healthz))
        .route("/readiness", get(readiness))
        .route("/readiness/ready", post(mark_ready))
        .route("/readiness/notready", post(mark_not_ready))
        .route("/metrics", get(metrics))
        .route("/scaleDown", post(scale_down))
        .route("/scaleUp", post(scale_up))
        .with_state(state)
}

/// Serve the API on `port` until the shutdown signal fires
pub async fn serve(
    port: u16,
    state: Arc<AppState>,
    shutdown: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    let addr = format!("0.0.0.0:{}", port);
    info!(addr = %addr, "Starting API server");

    let health = state.health_registry.clone();
    let listener = match tokio::net::TcpListener::bind(&addr).await {
        Ok(listener) => listener,
        Err(e) => {
            health
                .set_unhealthy(Component::ControlApi, format!("bind {}: {}", addr, e))
                .await;
            return Err(anyhow::Error::new(e).context(format!("Failed to bind {}", addr)));
        }
    };

    serve_on(listener, state, shutdown).await
}

/// Serve the API on an already bound listener
pub async fn serve_on(
    listener: tokio::net::TcpListener,
    state: Arc<AppState>,
    mut shutdown: broadcast::Receiver<()>,
) -> anyhow::Result<()> {
    let health = state.health_registry.clone();
    health.set_healthy(Component::ControlApi).await;

    let result = axum::serve(listener, create_router(state))
        .with_graceful_shutdown(async move {
            let _ = shutdown.recv().await;
        })
        .await;

    if let Err(e) = result {
        health
            .set_unhealthy(Component::ControlApi, format!("server error: {}", e))
            .await;
        return Err(e.into());
    }

    info!("API server stopped");
    Ok(())
}
