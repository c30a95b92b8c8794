use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use common::CorrelationId;

/// An event on the dispatcher: a declared type, the correlation ID that ties
/// it to one saga, and an opaque JSON payload.
///
/// The envelope is also the outbox wire format: `to_bytes`/`from_bytes` are
/// inverses, so a payload that goes through store → claim → publish arrives
/// bit-identical.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventEnvelope {
    pub event_type: String,
    pub correlation_id: CorrelationId,
    pub payload: serde_json::Value,
}

impl EventEnvelope {
    /// Creates an envelope by serializing `payload` to JSON.
    pub fn new<T: Serialize>(
        event_type: impl Into<String>,
        correlation_id: CorrelationId,
        payload: &T,
    ) -> Result<Self, serde_json::Error> {
        Ok(Self {
            event_type: event_type.into(),
            correlation_id,
            payload: serde_json::to_value(payload)?,
        })
    }

    /// Deserializes the payload into a typed value.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }

    /// Serializes the whole envelope for outbox storage.
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    /// Deserializes an envelope from outbox storage.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}
