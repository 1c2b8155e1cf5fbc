//! HTTP API: reading ingest, query projections, probes and metrics

use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use prognostics_lib::{
    fleet::Fleet, AssetId, ProbeRegistry, SensorReading, StageStatus, TaskStatus, Timestamp,
};
use prometheus::{Encoder, TextEncoder};
use serde::Deserialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{info, warn};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub fleet: Arc<Fleet>,
    pub probes: ProbeRegistry,
}

impl AppState {
    pub fn new(fleet: Arc<Fleet>, probes: ProbeRegistry) -> Self {
        Self { fleet, probes }
    }
}

fn error(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

/// Accept a batch of readings; waits while asset queues are full
async fn ingest(
    State(state): State<Arc<AppState>>,
    Json(readings): Json<Vec<SensorReading>>,
) -> Response {
    let submitted = readings.len();
    match state.fleet.ingest_batch(readings).await {
        Ok(accepted) => {
            (StatusCode::ACCEPTED, Json(json!({ "accepted": accepted }))).into_response()
        }
        Err(e) => {
            warn!(submitted, error = %e, "Reading batch not accepted");
            error(StatusCode::SERVICE_UNAVAILABLE, e.to_string())
        }
    }
}

async fn asset_health(State(state): State<Arc<AppState>>, Path(asset): Path<String>) -> Response {
    match state.fleet.view().current_health(&AssetId::from(asset.as_str())) {
        Some(health) => Json(health).into_response(),
        None => error(StatusCode::NOT_FOUND, format!("no health for asset '{asset}'")),
    }
}

#[derive(Debug, Deserialize)]
pub struct AlertQuery {
    pub since: Option<Timestamp>,
}

async fn alerts(State(state): State<Arc<AppState>>, Query(query): Query<AlertQuery>) -> Response {
    Json(state.fleet.view().alert_feed(query.since)).into_response()
}

#[derive(Debug, Deserialize)]
pub struct TaskQuery {
    pub asset: Option<String>,
    pub status: Option<String>,
}

async fn tasks(State(state): State<Arc<AppState>>, Query(query): Query<TaskQuery>) -> Response {
    let status = match query.status.as_deref().map(str::parse::<TaskStatus>).transpose() {
        Ok(status) => status,
        Err(e) => return error(StatusCode::BAD_REQUEST, e),
    };
    let asset = query.asset.map(AssetId::from);
    Json(state.fleet.view().maintenance_tasks(asset.as_ref(), status)).into_response()
}

/// Health check response - returns 200 if healthy or degraded, 503 if unhealthy
async fn healthz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let health = state.probes.health().await;

    let status_code = match health.status {
        StageStatus::Healthy | StageStatus::Degraded => StatusCode::OK,
        StageStatus::Unhealthy => StatusCode::SERVICE_UNAVAILABLE,
    };

    (status_code, Json(health))
}

/// Readiness check response - returns 200 if ready, 503 if not ready
async fn readyz(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let readiness = state.probes.readiness().await;

    let status_code = if readiness.ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (status_code, Json(readiness))
}

/// Prometheus metrics endpoint
async fn metrics() -> Response {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        return error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string());
    }

    (
        StatusCode::OK,
        [("content-type", "text/plain; charset=utf-8")],
        buffer,
    )
        .into_response()
}

/// Create the API router
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/v1/readings", post(ingest))
        .route("/v1/assets/:asset/health", get(asset_health))
        .route("/v1/alerts", get(alerts))
        .route("/v1/tasks", get(tasks))
        .route("/healthz", get(healthz))
        .route("/readyz", get(readyz))
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// Start the API server
pub async fn serve(port: u16, state: Arc<AppState>) -> anyhow::Result<()> {
    let app = create_router(state);

    let addr = format!("0.0.0.0:{}", port);
    info!(addr = %addr, "Starting API server");

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    axum::serve(listener, app).await?;

    Ok(())
}
