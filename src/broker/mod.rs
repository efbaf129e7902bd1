//! Broker collaborator.
//!
//! This module contains:
//! - `Broker` trait: publish, pull, settle (ack/nak/term), drain, connection status
//! - `BrokerAdmin` trait: stream and durable consumer provisioning
//! - `BrokerError` and the uniform "not found" classification used by topology
//! - Implementations: in-memory (`MemoryBroker`), NATS JetStream (`NatsBroker`)

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use tokio::sync::broadcast;

pub mod memory;
#[cfg(feature = "nats")]
pub mod nats;

pub use memory::{ConsumerStats, MemoryBroker};
#[cfg(feature = "nats")]
pub use nats::NatsBroker;

// ============================================================================
// Errors
// ============================================================================

/// Result type for broker operations.
pub type Result<T> = std::result::Result<T, BrokerError>;

/// JetStream API error code for a missing stream.
pub const STREAM_NOT_FOUND: u64 = 10059;
/// JetStream API error code for a missing consumer.
pub const CONSUMER_NOT_FOUND: u64 = 10014;
/// JetStream API error code for a stream name collision.
pub const STREAM_NAME_IN_USE: u64 = 10058;
/// JetStream API error code for overlapping stream subjects.
pub const STREAM_SUBJECT_OVERLAP: u64 = 10065;

/// Error code as reported by an admin API. Brokers and client libraries disagree on
/// whether codes are numbers or strings, so both are carried.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ApiErrorCode {
    Numeric(u64),
    Text(String),
}

impl fmt::Display for ApiErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Numeric(code) => write!(f, "{}", code),
            Self::Text(code) => f.write_str(code),
        }
    }
}

/// Structured admin API failure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiError {
    /// HTTP-like status (404, 400, 503...).
    pub status: Option<u16>,
    /// Broker-specific error code.
    pub code: Option<ApiErrorCode>,
    pub description: String,
}

/// Wire shape of a JetStream API error body: `{"error":{"code":404,"err_code":10059,...}}`,
/// or the same fields at top level.
#[derive(Deserialize)]
struct ErrorBody {
    error: Option<ErrorFields>,
    #[serde(flatten)]
    fields: ErrorFields,
}

#[derive(Deserialize, Default)]
struct ErrorFields {
    code: Option<serde_json::Value>,
    err_code: Option<serde_json::Value>,
    description: Option<String>,
}

fn code_from_json(value: &serde_json::Value) -> Option<ApiErrorCode> {
    match value {
        serde_json::Value::Number(n) => n.as_u64().map(ApiErrorCode::Numeric),
        serde_json::Value::String(s) => Some(ApiErrorCode::Text(s.clone())),
        _ => None,
    }
}

impl ApiError {
    pub fn new(status: Option<u16>, code: Option<ApiErrorCode>, description: impl Into<String>) -> Self {
        Self {
            status,
            code,
            description: description.into(),
        }
    }

    /// Build a not-found error in the JetStream shape.
    pub fn not_found(err_code: u64, description: impl Into<String>) -> Self {
        Self::new(Some(404), Some(ApiErrorCode::Numeric(err_code)), description)
    }

    /// Parse a raw JSON error body as returned by the broker's API.
    pub fn from_payload(payload: &str) -> Option<Self> {
        let body: ErrorBody = serde_json::from_str(payload).ok()?;
        let fields = body.error.unwrap_or(body.fields);
        let status = fields
            .code
            .as_ref()
            .and_then(|c| c.as_u64())
            .and_then(|c| u16::try_from(c).ok());
        let code = fields
            .err_code
            .as_ref()
            .and_then(code_from_json)
            .or_else(|| fields.code.as_ref().filter(|c| c.is_string()).and_then(code_from_json));
        if status.is_none() && code.is_none() && fields.description.is_none() {
            return None;
        }
        Some(Self {
            status,
            code,
            description: fields.description.unwrap_or_default(),
        })
    }

    /// Whether this error means the requested stream or consumer does not exist.
    ///
    /// Accepts a 404 status, the numeric JetStream codes, textual codes in any of
    /// their common spellings, and descriptions that embed a JSON error body.
    pub fn is_not_found(&self) -> bool {
        if self.status == Some(404) {
            return true;
        }
        let by_code = match &self.code {
            Some(ApiErrorCode::Numeric(code)) => {
                matches!(*code, 404 | STREAM_NOT_FOUND | CONSUMER_NOT_FOUND)
            }
            Some(ApiErrorCode::Text(text)) => is_not_found_text(text),
            None => false,
        };
        if by_code {
            return true;
        }
        if let Some(inner) = ApiError::from_payload(&self.description) {
            if inner != *self && inner.is_not_found() {
                return true;
            }
        }
        let description = self.description.to_ascii_lowercase();
        NOT_FOUND_PHRASES
            .iter()
            .any(|phrase| description.contains(phrase))
    }
}

/// Uncoded descriptions that still mean "does not exist".
const NOT_FOUND_PHRASES: [&str; 2] = ["stream not found", "consumer not found"];

fn is_not_found_text(text: &str) -> bool {
    let normalized: String = text
        .chars()
        .filter(|c| c.is_ascii_alphanumeric())
        .collect::<String>()
        .to_ascii_lowercase();
    if let Ok(code) = normalized.parse::<u64>() {
        return matches!(code, 404 | STREAM_NOT_FOUND | CONSUMER_NOT_FOUND);
    }
    normalized == "notfound" || normalized.ends_with("notfound")
}

impl fmt::Display for ApiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.description)?;
        match (&self.status, &self.code) {
            (Some(status), Some(code)) => write!(f, " (status {}, code {})", status, code),
            (Some(status), None) => write!(f, " (status {})", status),
            (None, Some(code)) => write!(f, " (code {})", code),
            (None, None) => Ok(()),
        }
    }
}

/// Errors that can occur during broker operations.
#[derive(Debug, Clone, thiserror::Error)]
pub enum BrokerError {
    #[error("Connection failed: {0}")]
    Connection(String),

    #[error("Publish failed: {0}")]
    Publish(String),

    #[error("No stream accepts subject '{0}'")]
    NoStream(String),

    #[error("Pull failed: {0}")]
    Pull(String),

    #[error("Acknowledgement failed: {0}")]
    Ack(String),

    #[error("Broker API error: {0}")]
    Api(ApiError),

    #[error("Broker operation timed out")]
    Timeout,
}

impl BrokerError {
    /// True for admin errors that mean "does not exist yet".
    pub fn is_not_found(&self) -> bool {
        match self {
            Self::Api(err) => err.is_not_found(),
            _ => false,
        }
    }
}

impl From<ApiError> for BrokerError {
    fn from(err: ApiError) -> Self {
        Self::Api(err)
    }
}

// ============================================================================
// Types
// ============================================================================

/// Stream definition as provisioned on the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamSpec {
    pub name: String,
    pub subjects: Vec<String>,
    /// Zero means unlimited.
    pub max_age: Duration,
    pub replicas: usize,
}

impl StreamSpec {
    pub fn new(name: impl Into<String>, subjects: Vec<String>) -> Self {
        Self {
            name: name.into(),
            subjects,
            max_age: Duration::ZERO,
            replicas: 1,
        }
    }
}

/// Durable pull consumer definition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerSpec {
    pub durable_name: String,
    pub filter_subject: String,
    /// Zero or negative means unlimited.
    pub max_deliver: i64,
    pub ack_wait: Duration,
}

/// Options for a single publish.
#[derive(Debug, Clone, Default)]
pub struct PublishOptions {
    /// Message id for the broker's duplicate window.
    pub msg_id: Option<String>,
    pub headers: HashMap<String, String>,
}

impl PublishOptions {
    pub fn with_msg_id(msg_id: impl Into<String>) -> Self {
        Self {
            msg_id: Some(msg_id.into()),
            headers: HashMap::new(),
        }
    }
}

/// Broker confirmation of a stored message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishAck {
    pub stream: String,
    pub sequence: u64,
    /// The msg id was already seen; nothing new was stored.
    pub duplicate: bool,
}

/// Connection status transitions.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionEvent {
    Connected,
    Disconnected,
    Reconnected,
    Error(String),
    Closed,
}

/// Settles a single delivered message.
#[async_trait]
pub trait Acker: Send + Sync {
    async fn ack(&self) -> Result<()>;
    async fn nak(&self, delay: Duration) -> Result<()>;
    async fn term(&self) -> Result<()>;
}

/// A message as pulled from a durable consumer.
#[derive(Clone)]
pub struct RawMessage {
    pub subject: String,
    pub payload: Bytes,
    pub headers: HashMap<String, String>,
    pub stream: String,
    pub stream_sequence: u64,
    /// Delivery count, starting at 1.
    pub deliveries: u32,
    pub acker: Arc<dyn Acker>,
}

impl fmt::Debug for RawMessage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RawMessage")
            .field("subject", &self.subject)
            .field("stream", &self.stream)
            .field("stream_sequence", &self.stream_sequence)
            .field("deliveries", &self.deliveries)
            .field("payload_len", &self.payload.len())
            .finish()
    }
}

// ============================================================================
// Traits
// ============================================================================

/// Data-plane operations of a persistent, ordered message log.
///
/// Implementations:
/// - `MemoryBroker`: in-process, for tests and single-process deployments
/// - `NatsBroker`: NATS JetStream (feature `nats`)
#[async_trait]
pub trait Broker: Send + Sync {
    /// Store a message on whichever stream accepts the subject.
    async fn publish(
        &self,
        subject: &str,
        payload: Bytes,
        options: PublishOptions,
    ) -> Result<PublishAck>;

    /// Fetch up to `batch` messages from a durable consumer, waiting at most `expires`.
    ///
    /// Returns an empty batch on timeout.
    async fn pull(
        &self,
        stream: &str,
        durable: &str,
        batch: usize,
        expires: Duration,
    ) -> Result<Vec<RawMessage>>;

    async fn ack(&self, message: &RawMessage) -> Result<()> {
        message.acker.ack().await
    }

    /// Request redelivery after `delay`.
    async fn nak(&self, message: &RawMessage, delay: Duration) -> Result<()> {
        message.acker.nak(delay).await
    }

    /// Refuse the message permanently.
    async fn term(&self, message: &RawMessage) -> Result<()> {
        message.acker.term().await
    }

    /// Stop deliveries and flush outstanding acknowledgements.
    async fn drain(&self) -> Result<()>;

    fn is_connected(&self) -> bool;

    fn connection_events(&self) -> broadcast::Receiver<ConnectionEvent>;
}

/// Control-plane operations used by topology provisioning.
#[async_trait]
pub trait BrokerAdmin: Send + Sync {
    async fn list_streams(&self) -> Result<Vec<StreamSpec>>;

    async fn stream_info(&self, name: &str) -> Result<StreamSpec>;

    async fn create_stream(&self, spec: &StreamSpec) -> Result<()>;

    async fn update_stream(&self, spec: &StreamSpec) -> Result<()>;

    async fn consumer_info(&self, stream: &str, durable: &str) -> Result<ConsumerSpec>;

    /// Create the consumer, or update it in place if it exists.
    async fn create_consumer(&self, stream: &str, spec: &ConsumerSpec) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_numeric_codes() {
        assert!(ApiError::not_found(STREAM_NOT_FOUND, "stream not found").is_not_found());
        assert!(ApiError::new(None, Some(ApiErrorCode::Numeric(CONSUMER_NOT_FOUND)), "x")
            .is_not_found());
        assert!(ApiError::new(Some(404), None, "").is_not_found());
    }

    #[test]
    fn test_not_found_text_codes() {
        for code in ["not_found", "NOT_FOUND", "NotFound", "StreamNotFound", "10059", "404"] {
            let err = ApiError::new(None, Some(ApiErrorCode::Text(code.to_string())), "");
            assert!(err.is_not_found(), "{code} should be not found");
        }
    }

    #[test]
    fn test_not_found_payload_in_description() {
        let err = ApiError::new(
            None,
            None,
            r#"{"type":"io.nats.jetstream.api.v1.stream_info_response","error":{"code":404,"err_code":10059,"description":"stream not found"}}"#,
        );
        assert!(err.is_not_found());
    }

    #[test]
    fn test_from_payload_top_level_fields() {
        let err = ApiError::from_payload(r#"{"code":"not_found","description":"no such stream"}"#)
            .unwrap();
        assert_eq!(err.status, None);
        assert_eq!(err.code, Some(ApiErrorCode::Text("not_found".to_string())));
        assert!(err.is_not_found());
    }

    #[test]
    fn test_other_errors_are_not_not_found() {
        let overlap = ApiError::new(
            Some(400),
            Some(ApiErrorCode::Numeric(STREAM_SUBJECT_OVERLAP)),
            "subjects overlap with an existing stream",
        );
        assert!(!overlap.is_not_found());
        assert!(!ApiError::new(Some(503), None, "jetstream not enabled").is_not_found());
        assert!(!BrokerError::Timeout.is_not_found());
        assert!(!BrokerError::Connection("not found".to_string()).is_not_found());
    }

    #[test]
    fn test_uncoded_description_needs_stream_or_consumer_phrase() {
        assert!(ApiError::new(None, None, "Stream Not Found").is_not_found());
        assert!(ApiError::new(None, None, "consumer not found").is_not_found());
        assert!(!ApiError::new(None, None, "peer not found for placement").is_not_found());
        assert!(!ApiError::new(Some(500), None, "account not found").is_not_found());
    }

    #[test]
    fn test_broker_error_delegates() {
        let err: BrokerError = ApiError::not_found(CONSUMER_NOT_FOUND, "consumer not found").into();
        assert!(err.is_not_found());
    }
}
