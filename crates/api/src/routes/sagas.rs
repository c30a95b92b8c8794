//! Saga and engine statistics endpoints.

use std::collections::HashMap;
use std::sync::Arc;

use axum::Json;
use axum::extract::{Path, State};
use common::CorrelationId;
use serde::Serialize;
use store::SagaStore;

use crate::error::ApiError;
use crate::routes::records::AppState;

#[derive(Serialize)]
pub struct StepStatusResponse {
    pub name: String,
    pub retry_count: u32,
    pub api_called: bool,
    pub response: Option<String>,
}

#[derive(Serialize)]
pub struct SagaStatusResponse {
    pub correlation_id: String,
    pub workflow: String,
    pub current_state: String,
    pub started_at: String,
    pub last_updated: String,
    pub completed_at: Option<String>,
    pub last_error: Option<String>,
    pub steps: Vec<StepStatusResponse>,
}

#[derive(Serialize)]
pub struct StatsResponse {
    pub records: u64,
    pub unprocessed_outbox: u64,
    pub sagas_by_state: HashMap<String, u64>,
}

/// GET /sagas/:id — current state and per-step progress of one saga.
#[tracing::instrument(skip(state))]
pub async fn get<S: SagaStore>(
    State(state): State<Arc<AppState<S>>>,
    Path(id): Path<String>,
) -> Result<Json<SagaStatusResponse>, ApiError> {
    let uuid = uuid::Uuid::parse_str(&id)
        .map_err(|e| ApiError::BadRequest(format!("Invalid correlation id: {e}")))?;
    let correlation_id = CorrelationId::from_uuid(uuid);

    let saga = state
        .store
        .load_saga(correlation_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("Saga {id} not found")))?;

    Ok(Json(SagaStatusResponse {
        correlation_id: saga.correlation_id.to_string(),
        workflow: saga.workflow,
        current_state: saga.current_state,
        started_at: saga.started_at.to_rfc3339(),
        last_updated: saga.last_updated.to_rfc3339(),
        completed_at: saga.completed_at.map(|t| t.to_rfc3339()),
        last_error: saga.last_error,
        steps: saga
            .steps
            .into_iter()
            .map(|s| StepStatusResponse {
                name: s.name,
                retry_count: s.retry_count,
                api_called: s.api_called,
                response: s.response,
            })
            .collect(),
    }))
}

/// GET /stats — record count, outbox backlog, and saga counts per state.
#[tracing::instrument(skip(state))]
pub async fn stats<S: SagaStore>(
    State(state): State<Arc<AppState<S>>>,
) -> Result<Json<StatsResponse>, ApiError> {
    Ok(Json(StatsResponse {
        records: state.store.record_count().await?,
        unprocessed_outbox: state.store.unprocessed_outbox_count().await?,
        sagas_by_state: state.store.saga_counts_by_state().await?,
    }))
}
