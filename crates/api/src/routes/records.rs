//! Record ingestion endpoint and shared application state.

use std::collections::HashMap;
use std::sync::Arc;

use axum::Json;
use axum::extract::State;
use axum::http::StatusCode;
use common::CorrelationId;
use ingress::ChannelSourceHandle;
use serde::{Deserialize, Serialize};
use store::{Record, SagaStore};

use crate::error::ApiError;

/// Shared application state accessible from all handlers.
pub struct AppState<S: SagaStore> {
    pub store: S,
    pub ingest: ChannelSourceHandle,
}

#[derive(Deserialize)]
pub struct IngestRequest {
    /// Record ID; generated when omitted. Submitting the same ID twice is
    /// idempotent (one saga).
    pub id: Option<String>,
    /// Step payloads keyed by message key.
    #[serde(default)]
    pub step_data: HashMap<String, serde_json::Value>,
}

#[derive(Serialize)]
pub struct IngestResponse {
    pub record_id: String,
}

/// POST /records — feeds a record into the in-process message source.
#[tracing::instrument(skip(state, req))]
pub async fn ingest<S: SagaStore>(
    State(state): State<Arc<AppState<S>>>,
    Json(req): Json<IngestRequest>,
) -> Result<(StatusCode, Json<IngestResponse>), ApiError> {
    let id = match req.id {
        Some(ref raw) => {
            let uuid = uuid::Uuid::parse_str(raw)
                .map_err(|e| ApiError::BadRequest(format!("Invalid record id: {e}")))?;
            CorrelationId::from_uuid(uuid)
        }
        None => CorrelationId::new(),
    };

    let record = Record::new(id, req.step_data);
    if !state.ingest.push(record).await {
        return Err(ApiError::Internal("ingest source is closed".to_string()));
    }

    Ok((
        StatusCode::ACCEPTED,
        Json(IngestResponse {
            record_id: id.to_string(),
        }),
    ))
}
