//! Health check endpoint.

use axum::Json;
use serde::Serialize;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub workflow: &'static str,
}

/// GET /health — returns engine health and the active workflow.
pub async fn check() -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        workflow: saga::order_processing::WORKFLOW,
    })
}
