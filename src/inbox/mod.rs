//! Inbox processor: run a handler at most once per logical event.
//!
//! A delivery is recorded before its handler runs. Redeliveries of a processed event
//! are acknowledged without running the handler; a row another worker is still
//! processing is left alone until it goes stale.
//!
//! Records are scoped to a consumer. The engine hands each durable consumer its own
//! [`InboxProcessor::for_consumer`] view, so subscribers sharing a subject each run
//! their handler once.

use std::future::Future;
use std::sync::Arc;

use chrono::{Duration as ChronoDuration, Utc};
use tracing::{debug, info, warn};

use crate::consumer::HandlerError;
use crate::repository::{
    minutes, InboxRepository, InboxStats, InboxStatus, NewInboxEvent, StorageError,
};

/// Default age after which a `processing` row may be claimed again.
pub const DEFAULT_STALE_TIMEOUT_MINUTES: u64 = 5;

#[derive(Debug, thiserror::Error)]
pub enum InboxError {
    #[error("Handler failed: {0}")]
    Handler(HandlerError),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

pub type Result<T> = std::result::Result<T, InboxError>;

/// What happened to an inbound event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboxOutcome {
    /// The handler ran and succeeded.
    Processed,
    /// A previous delivery already processed the event.
    AlreadyProcessed,
    /// Another worker holds a fresh claim on the event.
    InFlight,
}

#[derive(Clone)]
pub struct InboxProcessor {
    repository: Arc<dyn InboxRepository>,
    consumer: String,
    stale_timeout: ChronoDuration,
}

impl InboxProcessor {
    pub fn new(repository: Arc<dyn InboxRepository>) -> Self {
        Self {
            repository,
            consumer: String::new(),
            stale_timeout: minutes(DEFAULT_STALE_TIMEOUT_MINUTES),
        }
    }

    /// A view over the same repository recording rows under `consumer`.
    pub fn for_consumer(&self, consumer: impl Into<String>) -> Self {
        Self {
            consumer: consumer.into(),
            ..self.clone()
        }
    }

    pub fn consumer(&self) -> &str {
        &self.consumer
    }

    pub fn with_stale_timeout_minutes(mut self, stale_minutes: u64) -> Self {
        self.stale_timeout = minutes(stale_minutes);
        self
    }

    pub fn repository(&self) -> &Arc<dyn InboxRepository> {
        &self.repository
    }

    /// Run `handler(payload, context)` unless this consumer already handled the event.
    ///
    /// The row is recorded under this processor's consumer, whatever `event.consumer`
    /// says. Handler failures mark the row failed so the next delivery can claim it again.
    pub async fn process_outcome<C, F, Fut>(
        &self,
        mut event: NewInboxEvent,
        handler: F,
        context: C,
    ) -> Result<InboxOutcome>
    where
        F: FnOnce(Vec<u8>, C) -> Fut,
        Fut: Future<Output = std::result::Result<(), HandlerError>>,
    {
        event.consumer = self.consumer.clone();
        let payload = event.payload.clone();
        let (row, created) = self.repository.find_or_create(event).await?;
        let consumer = self.consumer.as_str();
        let key = row.event_id;

        if !created {
            if row.status == InboxStatus::Processed {
                debug!(event_id = %key, "Inbox event already processed");
                return Ok(InboxOutcome::AlreadyProcessed);
            }
            let stale_before = Utc::now() - self.stale_timeout;
            if self
                .repository
                .try_claim(consumer, &key, stale_before)
                .await?
                .is_none()
            {
                let current = self.repository.get(consumer, &key).await?;
                return Ok(match current.map(|r| r.status) {
                    Some(InboxStatus::Processed) => InboxOutcome::AlreadyProcessed,
                    _ => {
                        debug!(event_id = %key, "Inbox event in flight elsewhere");
                        InboxOutcome::InFlight
                    }
                });
            }
        }

        match handler(payload, context).await {
            Ok(()) => {
                self.repository.mark_as_processed(consumer, &key).await?;
                Ok(InboxOutcome::Processed)
            }
            Err(e) => {
                if let Err(storage) = self
                    .repository
                    .mark_as_failed(consumer, &key, &e.to_string())
                    .await
                {
                    warn!(event_id = %key, error = %storage, "Failed to record inbox failure");
                }
                Err(InboxError::Handler(e))
            }
        }
    }

    /// Like [`process_outcome`](Self::process_outcome), returning whether the handler ran.
    pub async fn process<C, F, Fut>(&self, event: NewInboxEvent, handler: F, context: C) -> Result<bool>
    where
        F: FnOnce(Vec<u8>, C) -> Fut,
        Fut: Future<Output = std::result::Result<(), HandlerError>>,
    {
        let outcome = self.process_outcome(event, handler, context).await?;
        Ok(outcome == InboxOutcome::Processed)
    }

    /// Whether this consumer has processed the event with dedup key `key`.
    pub async fn is_processed(&self, key: &str) -> Result<bool> {
        let row = self.repository.get(&self.consumer, key).await?;
        Ok(row.is_some_and(|r| r.status == InboxStatus::Processed))
    }

    /// Mark `processing` rows older than `stale_minutes` as failed.
    pub async fn reset_stale(&self, stale_minutes: u64) -> Result<u64> {
        let reset = self
            .repository
            .reset_stale(Utc::now() - minutes(stale_minutes))
            .await?;
        if reset > 0 {
            warn!(count = reset, "Reset stale inbox events");
        }
        Ok(reset)
    }

    /// Delete finished rows older than `retention_days`.
    pub async fn cleanup(&self, retention_days: u64) -> Result<u64> {
        let cutoff = Utc::now() - minutes(retention_days.saturating_mul(24 * 60));
        let removed = self.repository.cleanup(cutoff).await?;
        if removed > 0 {
            info!(count = removed, "Cleaned up inbox events");
        }
        Ok(removed)
    }

    pub async fn stats(&self) -> Result<InboxStats> {
        Ok(self.repository.count_by_status().await?)
    }
}

#[cfg(test)]
mod tests;
