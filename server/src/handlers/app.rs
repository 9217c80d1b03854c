use std::sync::Arc;

use axum::{extract::DefaultBodyLimit, routing, Router};
use durq::{Queue, QueueClient};

use super::{enqueue, jobs};

#[derive(Clone)]
pub struct AppState {
    pub client: QueueClient,
    pub queue: Arc<Queue>,
}

pub fn app(state: AppState) -> Router {
    let max_body = state.client.limits().max_payload_bytes;

    Router::new()
        .route("/", routing::get(index))
        .route("/_readiness", routing::get(jobs::readiness))
        .route("/stats", routing::get(jobs::stats))
        .route("/jobs/:id", routing::get(jobs::status))
        .route("/enqueue/", routing::put(enqueue::put))
        .route("/enqueue/:job_type", routing::put(enqueue::put))
        .layer(DefaultBodyLimit::max(max_body))
        .with_state(state)
}

pub async fn index() -> &'static str {
    "durq"
}
