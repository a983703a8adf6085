//! Manager HTTP API
//!
//! Thin adapter over [`WorkerRegistry`]; every handler maps one registry
//! operation to one JSON response.

use crate::registry::{RegistryStatus, WorkerRegistry};
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, error, info, warn};
use voice_insight_common::{ManagerError, METRICS};
use voice_insight_proto::{
    ErrorResponse, HealthResponse, MemoryStatus, SpawnResponse, StatusResponse, SuccessResponse,
    WorkerStatus,
};

/// Shared handler state
#[derive(Clone)]
pub struct ApiState {
    pub registry: Arc<WorkerRegistry>,
    pub metrics_enabled: bool,
}

/// Build the manager router
pub fn router(registry: Arc<WorkerRegistry>, metrics_enabled: bool) -> Router {
    let state = ApiState {
        registry,
        metrics_enabled,
    };

    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/spawn/{alias}", post(spawn))
        .route("/touch/{alias}", post(touch))
        .route("/stop/{alias}", post(stop))
        .route("/stop-all", post(stop_all))
        .route("/metrics", get(metrics))
        .with_state(state)
}

/// Registry error rendered as `{"detail": ...}`
#[derive(Debug)]
pub struct ApiError(ManagerError);

impl From<ManagerError> for ApiError {
    fn from(err: ManagerError) -> Self {
        Self(err)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status =
            StatusCode::from_u16(self.0.status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
        if status.is_server_error() {
            warn!(status = status.as_u16(), "Request failed: {}", self.0);
        }

        let body = ErrorResponse {
            detail: self.0.detail(),
        };
        (status, Json(body)).into_response()
    }
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse::healthy())
}

async fn status(State(state): State<ApiState>) -> Json<StatusResponse> {
    Json(status_response(&state.registry.snapshot_status()))
}

async fn spawn(
    State(state): State<ApiState>,
    Path(alias): Path<String>,
) -> Result<Json<SpawnResponse>, ApiError> {
    let worker = state.registry.ensure(&alias).await?;

    Ok(Json(SpawnResponse {
        alias: worker.alias,
        port: worker.port,
        memory_gb: worker.footprint_gb,
        model_type: worker.backend_kind.to_string(),
    }))
}

async fn touch(State(state): State<ApiState>, Path(alias): Path<String>) -> Json<SuccessResponse> {
    if !state.registry.touch(&alias) {
        debug!(alias = %alias, "Touch for a worker that is not running");
    }
    Json(SuccessResponse::new(true))
}

async fn stop(State(state): State<ApiState>, Path(alias): Path<String>) -> Json<SuccessResponse> {
    Json(SuccessResponse::new(state.registry.stop(&alias).await))
}

async fn stop_all(State(state): State<ApiState>) -> Json<SuccessResponse> {
    let stopped = state.registry.stop_all().await;
    info!(stopped, "Stopped all workers");
    Json(SuccessResponse::new(true))
}

async fn metrics(State(state): State<ApiState>) -> Response {
    if !state.metrics_enabled {
        return StatusCode::NOT_FOUND.into_response();
    }

    match METRICS.gather() {
        Ok(body) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            body,
        )
            .into_response(),
        Err(e) => {
            error!("Failed to encode metrics: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Wire shape of a registry status: GB to two decimals, usage to one,
/// durations in whole seconds
pub fn status_response(status: &RegistryStatus) -> StatusResponse {
    let memory = MemoryStatus {
        total_gb: round_to(status.memory.total_gb, 2),
        used_gb: round_to(status.memory.used_gb, 2),
        available_gb: round_to(status.memory.available_gb, 2),
        usage_percent: round_to(status.memory.usage_percent(), 1),
    };

    let workers: BTreeMap<String, WorkerStatus> = status
        .workers
        .iter()
        .map(|worker| {
            (
                worker.alias.clone(),
                WorkerStatus {
                    port: worker.port,
                    model_path: worker.model_path.clone(),
                    model_type: worker.backend_kind.to_string(),
                    memory_gb: worker.footprint_gb,
                    uptime_seconds: worker.uptime.as_secs(),
                    idle_seconds: worker.idle_time.as_secs(),
                    request_count: worker.request_count,
                },
            )
        })
        .collect();

    StatusResponse { memory, workers }
}

fn round_to(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}
