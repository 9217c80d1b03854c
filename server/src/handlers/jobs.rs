use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use durq::{Error, JobCounts, JobId, JobStatus};
use serde_json::{json, Value};
use tracing::error;

use super::AppState;

type JsonError = (StatusCode, Json<Value>);

fn internal_error(err: Error) -> JsonError {
    error!("internal error: {}", err);
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "error": err.to_string() })),
    )
}

pub async fn status(
    State(state): State<AppState>,
    Path(id): Path<JobId>,
) -> Result<Json<JobStatus>, JsonError> {
    match state.queue.get_job_status(id).await {
        Ok(status) => Ok(Json(status)),
        Err(Error::NotFound) => Err((
            StatusCode::NOT_FOUND,
            Json(json!({ "error": "job not found" })),
        )),
        Err(e) => Err(internal_error(e)),
    }
}

pub async fn stats(State(state): State<AppState>) -> Result<Json<JobCounts>, JsonError> {
    state.queue.job_counts().await.map(Json).map_err(internal_error)
}

pub async fn readiness(State(state): State<AppState>) -> (StatusCode, &'static str) {
    match state.queue.health_check().await {
        Ok(()) => (StatusCode::OK, "ok"),
        Err(e) => {
            error!("readiness check failed: {}", e);
            (StatusCode::SERVICE_UNAVAILABLE, "store unavailable")
        }
    }
}
