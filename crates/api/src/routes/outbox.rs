//! Outbox inspection endpoint.

use std::sync::Arc;

use axum::Json;
use axum::extract::{Query, State};
use serde::{Deserialize, Serialize};
use store::SagaStore;

use crate::error::ApiError;
use crate::routes::records::AppState;

#[derive(Debug, Deserialize)]
pub struct RecentQuery {
    pub limit: Option<usize>,
}

#[derive(Serialize)]
pub struct OutboxRowResponse {
    pub id: String,
    pub event_type: String,
    pub scheduled_for: String,
    pub processed: bool,
    pub processed_at: Option<String>,
    pub retry_count: u32,
    pub last_error: Option<String>,
    pub dead_lettered: bool,
}

/// GET /outbox/recent?limit=N — the most recent outbox rows with status,
/// newest first. Dead-lettered rows are flagged explicitly.
#[tracing::instrument(skip(state))]
pub async fn recent<S: SagaStore>(
    State(state): State<Arc<AppState<S>>>,
    Query(query): Query<RecentQuery>,
) -> Result<Json<Vec<OutboxRowResponse>>, ApiError> {
    let limit = query.limit.unwrap_or(20).min(500);
    let rows = state.store.recent_outbox(limit).await?;

    Ok(Json(
        rows.into_iter()
            .map(|r| OutboxRowResponse {
                id: r.id.to_string(),
                event_type: r.event_type.clone(),
                scheduled_for: r.scheduled_for.to_rfc3339(),
                processed: r.processed,
                processed_at: r.processed_at.map(|t| t.to_rfc3339()),
                retry_count: r.retry_count,
                last_error: r.last_error.clone(),
                dead_lettered: r.is_dead_lettered(),
            })
            .collect(),
    ))
}
