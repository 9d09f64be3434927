use axum::{
    extract::State,
    http::{header, StatusCode},
    response::IntoResponse,
    Json,
};
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

use callaudit_core::{job::JobFilter, queue::QueueStats, worker::PoolStatus};

use crate::metrics::{collect_dynamic_metrics, encode_metrics, JOB_STATUSES};
use crate::state::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
}

#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub version: &'static str,
    pub pool: PoolStatus,
    pub queue: QueueStats,
    /// Job count by status.
    pub jobs: BTreeMap<&'static str, i64>,
    pub reconciler_running: bool,
}

/// GET /health
pub async fn health() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok".to_string(),
    })
}

/// GET /status
///
/// Worker pool, queue and job counters.
pub async fn get_status(
    State(state): State<Arc<AppState>>,
) -> Result<Json<StatusResponse>, (StatusCode, Json<ErrorResponse>)> {
    let internal = |e: String| {
        (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ErrorResponse { error: e }),
        )
    };

    let queue = state.queue().stats().map_err(|e| internal(e.to_string()))?;

    let mut jobs = BTreeMap::new();
    for status in JOB_STATUSES {
        let count = state
            .job_store()
            .count_jobs(&JobFilter::new().with_status(status))
            .map_err(|e| internal(e.to_string()))?;
        jobs.insert(status.as_str(), count);
    }

    Ok(Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION"),
        pool: state.pool().status(),
        queue,
        jobs,
        reconciler_running: state.reconciler().is_running(),
    }))
}

/// GET /metrics
///
/// Prometheus text exposition.
pub async fn metrics(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    collect_dynamic_metrics(&state);
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
        encode_metrics(),
    )
}
