//! Outbox and inbox persistence.
//!
//! Both repositories expose atomic find-or-create and compare-and-set status claims;
//! callers never read-then-write. Timestamps are UTC.
//!
//! Implementations:
//! - `memory`: mutex-guarded maps, for tests and single-process use
//! - `sqlite`: SQLite via sqlx + sea-query (feature `sqlite`)

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

pub mod memory;
#[cfg(feature = "sqlite")]
pub mod sqlite;

pub use memory::{MemoryInboxRepository, MemoryOutboxRepository};
#[cfg(feature = "sqlite")]
pub use sqlite::{SqliteInboxRepository, SqliteOutboxRepository};

/// Errors that can occur during repository operations.
#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("Record not found: {0}")]
    NotFound(String),

    #[error("Corrupt record {key}: {reason}")]
    Corrupt { key: String, reason: String },

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[cfg(feature = "sqlite")]
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),
}

/// Result type for repository operations.
pub type Result<T> = std::result::Result<T, StorageError>;

/// Fixed-width RFC 3339 rendering, so stored timestamps compare lexicographically.
pub(crate) fn timestamp(at: DateTime<Utc>) -> String {
    at.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Minutes as a chrono duration, clamped to a century so cutoff arithmetic cannot overflow.
pub(crate) fn minutes(value: u64) -> chrono::Duration {
    chrono::Duration::minutes(value.min(MAX_WINDOW_MINUTES) as i64)
}

const MAX_WINDOW_MINUTES: u64 = 100 * 366 * 24 * 60;

// ============================================================================
// Outbox
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutboxStatus {
    Pending,
    Publishing,
    Sent,
    Failed,
}

impl OutboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Publishing => "publishing",
            Self::Sent => "sent",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for OutboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for OutboxStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "pending" => Ok(Self::Pending),
            "publishing" => Ok(Self::Publishing),
            "sent" => Ok(Self::Sent),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown outbox status '{}'", other)),
        }
    }
}

/// Outbox row as supplied by the caller.
#[derive(Debug, Clone, PartialEq)]
pub struct NewOutboxEvent {
    pub event_id: String,
    pub subject: String,
    pub payload: Vec<u8>,
    pub headers: HashMap<String, String>,
}

impl NewOutboxEvent {
    pub fn new(event_id: impl Into<String>, subject: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            event_id: event_id.into(),
            subject: subject.into(),
            payload,
            headers: HashMap::new(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

/// Persisted outbox row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutboxEvent {
    pub event_id: String,
    pub subject: String,
    pub payload: Vec<u8>,
    pub headers: HashMap<String, String>,
    pub status: OutboxStatus,
    /// Send attempts so far.
    pub attempts: u32,
    pub error_message: Option<String>,
    pub enqueued_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub sent_at: Option<DateTime<Utc>>,
}

impl OutboxEvent {
    pub(crate) fn from_new(event: NewOutboxEvent, now: DateTime<Utc>) -> Self {
        Self {
            event_id: event.event_id,
            subject: event.subject,
            payload: event.payload,
            headers: event.headers,
            status: OutboxStatus::Pending,
            attempts: 0,
            error_message: None,
            enqueued_at: now,
            updated_at: now,
            sent_at: None,
        }
    }
}

/// Outbox row counts by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct OutboxStats {
    pub pending: u64,
    pub publishing: u64,
    pub sent: u64,
    pub failed: u64,
}

impl OutboxStats {
    pub fn total(&self) -> u64 {
        self.pending + self.publishing + self.sent + self.failed
    }

    pub(crate) fn add(&mut self, status: OutboxStatus, count: u64) {
        match status {
            OutboxStatus::Pending => self.pending += count,
            OutboxStatus::Publishing => self.publishing += count,
            OutboxStatus::Sent => self.sent += count,
            OutboxStatus::Failed => self.failed += count,
        }
    }
}

/// Storage for outbox rows.
#[async_trait]
pub trait OutboxRepository: Send + Sync {
    /// Insert the row unless one with the same event id exists. Returns the stored row
    /// and whether this call created it.
    async fn find_or_create(&self, event: NewOutboxEvent) -> Result<(OutboxEvent, bool)>;

    async fn get(&self, event_id: &str) -> Result<Option<OutboxEvent>>;

    /// Compare-and-set to `publishing`, counting one attempt.
    ///
    /// Succeeds from `pending` or `failed`, or from a `publishing` row last touched
    /// before `stale_before`. Returns false if the row is sent or owned elsewhere.
    async fn mark_publishing(&self, event_id: &str, stale_before: DateTime<Utc>) -> Result<bool>;

    async fn mark_as_sent(&self, event_id: &str) -> Result<()>;

    async fn mark_as_failed(&self, event_id: &str, error: &str) -> Result<()>;

    /// Oldest `pending` rows first.
    async fn find_pending(&self, limit: usize) -> Result<Vec<OutboxEvent>>;

    /// Move `failed` rows with fewer than `max_attempts` attempts back to `pending`.
    async fn requeue_failed(&self, max_attempts: u32) -> Result<u64>;

    /// Move `publishing` rows last touched before `cutoff` back to `pending`.
    async fn reset_stale(&self, cutoff: DateTime<Utc>) -> Result<u64>;

    /// Delete `sent` rows sent before `cutoff`.
    async fn cleanup(&self, cutoff: DateTime<Utc>) -> Result<u64>;

    async fn count_by_status(&self) -> Result<OutboxStats>;
}

// ============================================================================
// Inbox
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum InboxStatus {
    Processing,
    Processed,
    Failed,
}

impl InboxStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Processing => "processing",
            Self::Processed => "processed",
            Self::Failed => "failed",
        }
    }
}

impl fmt::Display for InboxStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for InboxStatus {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s {
            "processing" => Ok(Self::Processing),
            "processed" => Ok(Self::Processed),
            "failed" => Ok(Self::Failed),
            other => Err(format!("unknown inbox status '{}'", other)),
        }
    }
}

/// Inbox row for a received message.
///
/// Rows are scoped by `consumer`: each durable consumer records its own outcome for
/// the same logical event.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct NewInboxEvent {
    pub consumer: String,
    /// Producer-assigned event id, if the message carried one.
    pub event_id: Option<String>,
    pub stream: String,
    pub stream_seq: u64,
    pub subject: String,
    pub payload: Vec<u8>,
}

impl NewInboxEvent {
    /// Dedup key within the consumer: the event id, else `stream:sequence`.
    pub fn key(&self) -> String {
        match &self.event_id {
            Some(id) if !id.is_empty() => id.clone(),
            _ => format!("{}:{}", self.stream, self.stream_seq),
        }
    }
}

/// Persisted inbox row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InboxEvent {
    pub consumer: String,
    /// Dedup key (see [`NewInboxEvent::key`]).
    pub event_id: String,
    pub stream: String,
    pub stream_seq: u64,
    pub subject: String,
    pub payload: Vec<u8>,
    pub status: InboxStatus,
    /// Handler runs claimed so far.
    pub deliveries: u32,
    pub error_message: Option<String>,
    pub received_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub processed_at: Option<DateTime<Utc>>,
}

impl InboxEvent {
    pub(crate) fn from_new(event: NewInboxEvent, now: DateTime<Utc>) -> Self {
        Self {
            event_id: event.key(),
            consumer: event.consumer,
            stream: event.stream,
            stream_seq: event.stream_seq,
            subject: event.subject,
            payload: event.payload,
            status: InboxStatus::Processing,
            deliveries: 1,
            error_message: None,
            received_at: now,
            updated_at: now,
            processed_at: None,
        }
    }
}

/// Inbox row counts by status.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct InboxStats {
    pub processing: u64,
    pub processed: u64,
    pub failed: u64,
}

impl InboxStats {
    pub fn total(&self) -> u64 {
        self.processing + self.processed + self.failed
    }

    pub(crate) fn add(&mut self, status: InboxStatus, count: u64) {
        match status {
            InboxStatus::Processing => self.processing += count,
            InboxStatus::Processed => self.processed += count,
            InboxStatus::Failed => self.failed += count,
        }
    }
}

/// Storage for inbox rows, keyed by `(consumer, key)`.
#[async_trait]
pub trait InboxRepository: Send + Sync {
    /// Insert a `processing` row unless the consumer already has one for the same key
    /// or the same `(stream, stream_seq)`. Returns the stored row and whether this call
    /// created it.
    async fn find_or_create(&self, event: NewInboxEvent) -> Result<(InboxEvent, bool)>;

    async fn get(&self, consumer: &str, key: &str) -> Result<Option<InboxEvent>>;

    /// Compare-and-set a `failed` row, or a `processing` row last touched before
    /// `stale_before`, back to `processing`, counting one delivery.
    async fn try_claim(
        &self,
        consumer: &str,
        key: &str,
        stale_before: DateTime<Utc>,
    ) -> Result<Option<InboxEvent>>;

    async fn mark_as_processed(&self, consumer: &str, key: &str) -> Result<()>;

    async fn mark_as_failed(&self, consumer: &str, key: &str, error: &str) -> Result<()>;

    /// Move `processing` rows last touched before `cutoff` to `failed`.
    async fn reset_stale(&self, cutoff: DateTime<Utc>) -> Result<u64>;

    /// Delete settled (`processed` or `failed`) rows last touched before `cutoff`.
    async fn cleanup(&self, cutoff: DateTime<Utc>) -> Result<u64>;

    async fn count_by_status(&self) -> Result<InboxStats>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_inbox_key_prefers_event_id() {
        let mut event = NewInboxEvent {
            consumer: "billing".to_string(),
            event_id: Some("order-1".to_string()),
            stream: "COURIER".to_string(),
            stream_seq: 7,
            subject: "production.orders.created".to_string(),
            payload: Vec::new(),
        };
        assert_eq!(event.key(), "order-1");

        event.event_id = None;
        assert_eq!(event.key(), "COURIER:7");

        event.event_id = Some(String::new());
        assert_eq!(event.key(), "COURIER:7");
    }

    #[test]
    fn test_status_text_round_trip() {
        for status in [
            OutboxStatus::Pending,
            OutboxStatus::Publishing,
            OutboxStatus::Sent,
            OutboxStatus::Failed,
        ] {
            assert_eq!(status.as_str().parse::<OutboxStatus>().unwrap(), status);
        }
        assert!("archived".parse::<InboxStatus>().is_err());
    }

    #[test]
    fn test_timestamps_sort_lexicographically() {
        let early = DateTime::parse_from_rfc3339("2026-01-01T00:00:00.5Z")
            .unwrap()
            .with_timezone(&Utc);
        let late = DateTime::parse_from_rfc3339("2026-01-01T00:00:01Z")
            .unwrap()
            .with_timezone(&Utc);
        assert!(timestamp(early) < timestamp(late));
    }
}
