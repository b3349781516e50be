//! Ingestion wire format and the transport seam.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::TransportError;
use crate::model::{CaptureEvent, CaptureKind, Payload, SessionId};

/// Request body posted to the ingestion endpoint
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IngestBatch {
    pub events: Vec<OutgoingEvent>,
}

/// One event as sent on the wire. The event id doubles as idempotency key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutgoingEvent {
    pub idempotency_key: String,
    pub session_id: SessionId,
    pub consent_version: String,
    pub kind: CaptureKind,
    pub payload: Payload,
    pub created_at: DateTime<Utc>,
}

impl From<&CaptureEvent> for OutgoingEvent {
    fn from(event: &CaptureEvent) -> Self {
        Self {
            idempotency_key: event.id().as_key(),
            session_id: event.session_id(),
            consent_version: event.consent_version().to_string(),
            kind: event.kind(),
            payload: event.payload().clone(),
            created_at: event.created_at(),
        }
    }
}

impl IngestBatch {
    pub fn from_events<'a, I>(events: I) -> Self
    where
        I: IntoIterator<Item = &'a CaptureEvent>,
    {
        Self {
            events: events.into_iter().map(OutgoingEvent::from).collect(),
        }
    }
}

/// Per-event outcome reported by the endpoint
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EventResult {
    pub idempotency_key: String,
    pub status: u16,
}

/// Response body of the ingestion endpoint
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BatchResponse {
    pub results: Vec<EventResult>,
}

impl BatchResponse {
    /// Status reported for `key`; the first entry wins if repeated
    pub fn status_of(&self, key: &str) -> Option<u16> {
        self.results
            .iter()
            .find(|r| r.idempotency_key == key)
            .map(|r| r.status)
    }
}

/// Sends one batch to the ingestion endpoint.
///
/// Returns `Err(TransportError::Status(code))` when the endpoint rejects the
/// request as a whole, and `Ok` with per-event statuses otherwise.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait IngestTransport: Send + Sync {
    async fn send_batch(&self, batch: &IngestBatch) -> Result<BatchResponse, TransportError>;
}
