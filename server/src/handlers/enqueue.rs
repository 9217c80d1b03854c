use axum::{
    body::Bytes,
    extract::{rejection::BytesRejection, Path, State},
    http::StatusCode,
    Json,
};
use durq::{ErrorKind, JobId};
use serde::{Deserialize, Serialize};
use tracing::{debug, error};

use super::AppState;

#[derive(Serialize, Deserialize, Debug)]
pub struct EnqueueResponse {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<JobId>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

type ErrorResponse = (StatusCode, Json<EnqueueResponse>);

fn error_response(status: StatusCode, message: String) -> ErrorResponse {
    (
        status,
        Json(EnqueueResponse {
            id: None,
            error: Some(message),
        }),
    )
}

/// `PUT /enqueue/:job_type`, with the job's payload as the request body.
pub async fn put(
    State(state): State<AppState>,
    job_type: Option<Path<String>>,
    body: Result<Bytes, BytesRejection>,
) -> Result<Json<EnqueueResponse>, ErrorResponse> {
    let job_type = job_type.map(|Path(job_type)| job_type).unwrap_or_default();

    let body = body.map_err(|rejection| {
        let status = match rejection.status() {
            StatusCode::PAYLOAD_TOO_LARGE => StatusCode::BAD_REQUEST,
            status => status,
        };
        error_response(status, rejection.body_text())
    })?;

    debug!(%job_type, payload_len = body.len(), "received job");

    match state.client.enqueue(&job_type, body.to_vec()).await {
        Ok(id) => Ok(Json(EnqueueResponse {
            id: Some(id),
            error: None,
        })),
        Err(e) if e.kind() == ErrorKind::Validation => {
            Err(error_response(StatusCode::BAD_REQUEST, e.to_string()))
        }
        Err(e) => {
            error!("failed to enqueue job: {}", e);
            Err(error_response(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
        }
    }
}
