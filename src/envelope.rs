//! Message envelope.
//!
//! Every published payload travels inside an [`Envelope`] serialized as JSON. The
//! `event_id` is the deduplication key for both the broker's duplicate window and
//! the inbox.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Current envelope schema version.
pub const SCHEMA_VERSION: u32 = 1;

/// Broker header carrying the message id used for duplicate suppression.
pub const MSG_ID_HEADER: &str = "Nats-Msg-Id";
/// Header carrying the logical event id.
pub const EVENT_ID_HEADER: &str = "Courier-Event-Id";
/// Header carrying the trace id, when present.
pub const TRACE_ID_HEADER: &str = "Courier-Trace-Id";

/// Payload wrapper with identity and provenance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub event_id: String,
    pub schema_version: u32,
    pub producer: String,
    pub occurred_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub trace_id: Option<String>,
    pub payload: serde_json::Value,
}

impl Envelope {
    /// Wrap a payload, generating an event id when none is supplied.
    pub fn new(producer: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            event_id: Uuid::new_v4().to_string(),
            schema_version: SCHEMA_VERSION,
            producer: producer.into(),
            occurred_at: Utc::now(),
            trace_id: None,
            payload,
        }
    }

    /// Use a caller-assigned event id. A blank id keeps the generated one.
    pub fn with_event_id(mut self, event_id: impl Into<String>) -> Self {
        let event_id = event_id.into();
        if !event_id.trim().is_empty() {
            self.event_id = event_id;
        }
        self
    }

    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }

    pub fn with_schema_version(mut self, version: u32) -> Self {
        self.schema_version = version;
        self
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, serde_json::Error> {
        serde_json::from_slice(bytes)
    }
}
