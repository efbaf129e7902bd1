//! Outbox publisher: record an event before sending it, send it at most once.
//!
//! The flow per event:
//!
//! 1. `find_or_create` the row keyed by event id
//! 2. claim it (`pending`/`failed` → `publishing`) with a compare-and-set
//! 3. send; mark `sent` on success, `failed` with the error otherwise
//!
//! A row left in `publishing` by a crashed process becomes claimable once it is older
//! than the stale timeout. The broker-side message id equals the event id, so a send
//! repeated after such a crash is deduplicated by the broker too.
//!
//! The sweeper re-drives pending and failed rows and runs retention for both the
//! outbox and the inbox.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::{Duration as ChronoDuration, Utc};
use futures::future::BoxFuture;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::broker::{Broker, PublishOptions};
use crate::config::{InboxConfig, OutboxConfig};
use crate::consumer::HandlerError;
use crate::inbox::InboxProcessor;
use crate::repository::{
    minutes, NewOutboxEvent, OutboxEvent, OutboxRepository, OutboxStats, OutboxStatus,
    StorageError,
};
use crate::topology::TopologyManager;

/// Default age after which a `publishing` row may be claimed again.
pub const DEFAULT_STALE_TIMEOUT_MINUTES: u64 = 5;

#[derive(Debug, thiserror::Error)]
pub enum OutboxError {
    #[error("Send failed for event {event_id}: {source}")]
    Send {
        event_id: String,
        source: HandlerError,
    },

    #[error(transparent)]
    Storage(#[from] StorageError),
}

pub type Result<T> = std::result::Result<T, OutboxError>;

/// Sends one outbox row to the broker.
pub type SendFn = Arc<dyn Fn(OutboxEvent) -> BoxFuture<'static, std::result::Result<(), HandlerError>> + Send + Sync>;

/// What happened to a publish request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Sent by this call.
    Sent,
    /// An earlier call already sent the event.
    AlreadySent,
    /// Another publisher holds a fresh claim on the event.
    InFlight,
}

/// Result of re-driving a batch of rows.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BatchReport {
    pub sent: usize,
    pub skipped: usize,
    /// Event id and error for each failed send.
    pub failed: Vec<(String, String)>,
}

pub struct OutboxPublisher {
    repository: Arc<dyn OutboxRepository>,
    stale_timeout: ChronoDuration,
}

impl OutboxPublisher {
    pub fn new(repository: Arc<dyn OutboxRepository>) -> Self {
        Self {
            repository,
            stale_timeout: minutes(DEFAULT_STALE_TIMEOUT_MINUTES),
        }
    }

    pub fn with_stale_timeout_minutes(mut self, stale_minutes: u64) -> Self {
        self.stale_timeout = minutes(stale_minutes);
        self
    }

    pub fn repository(&self) -> &Arc<dyn OutboxRepository> {
        &self.repository
    }

    /// Record the event without sending it. Returns the row and whether it was new.
    pub async fn enqueue(&self, event: NewOutboxEvent) -> Result<(OutboxEvent, bool)> {
        Ok(self.repository.find_or_create(event).await?)
    }

    /// Record the event and send it unless it was already sent or is being sent.
    pub async fn publish<F, Fut, E>(&self, event: NewOutboxEvent, send: F) -> Result<PublishOutcome>
    where
        F: FnOnce(OutboxEvent) -> Fut,
        Fut: Future<Output = std::result::Result<(), E>>,
        E: Into<HandlerError>,
    {
        let (row, _) = self.repository.find_or_create(event).await?;
        self.send_row(row, send).await
    }

    async fn send_row<F, Fut, E>(&self, row: OutboxEvent, send: F) -> Result<PublishOutcome>
    where
        F: FnOnce(OutboxEvent) -> Fut,
        Fut: Future<Output = std::result::Result<(), E>>,
        E: Into<HandlerError>,
    {
        if row.status == OutboxStatus::Sent {
            debug!(event_id = %row.event_id, "Outbox event already sent");
            return Ok(PublishOutcome::AlreadySent);
        }

        let stale_before = Utc::now() - self.stale_timeout;
        if !self
            .repository
            .mark_publishing(&row.event_id, stale_before)
            .await?
        {
            let current = self.repository.get(&row.event_id).await?;
            return Ok(match current.map(|r| r.status) {
                Some(OutboxStatus::Sent) => PublishOutcome::AlreadySent,
                _ => {
                    debug!(event_id = %row.event_id, "Outbox event in flight elsewhere");
                    PublishOutcome::InFlight
                }
            });
        }

        let event_id = row.event_id.clone();
        match send(row).await {
            Ok(()) => {
                self.repository.mark_as_sent(&event_id).await?;
                debug!(event_id = %event_id, "Outbox event sent");
                Ok(PublishOutcome::Sent)
            }
            Err(e) => {
                let source: HandlerError = e.into();
                warn!(event_id = %event_id, error = %source, "Outbox send failed");
                self.repository
                    .mark_as_failed(&event_id, &source.to_string())
                    .await?;
                Err(OutboxError::Send { event_id, source })
            }
        }
    }

    /// Send up to `limit` pending rows, oldest first.
    ///
    /// Send failures are collected in the report rather than aborting the batch.
    pub async fn publish_pending<F, Fut, E>(&self, limit: usize, send: F) -> Result<BatchReport>
    where
        F: Fn(OutboxEvent) -> Fut,
        Fut: Future<Output = std::result::Result<(), E>>,
        E: Into<HandlerError>,
    {
        let mut report = BatchReport::default();
        for row in self.repository.find_pending(limit).await? {
            match self.send_row(row, &send).await {
                Ok(PublishOutcome::Sent) => report.sent += 1,
                Ok(_) => report.skipped += 1,
                Err(OutboxError::Send { event_id, source }) => {
                    report.failed.push((event_id, source.to_string()));
                }
                Err(e) => return Err(e),
            }
        }
        Ok(report)
    }

    /// Return `publishing` rows older than `stale_minutes` to `pending`.
    pub async fn reset_stale(&self, stale_minutes: u64) -> Result<u64> {
        let reset = self
            .repository
            .reset_stale(Utc::now() - minutes(stale_minutes))
            .await?;
        if reset > 0 {
            warn!(count = reset, "Reset stale outbox events");
        }
        Ok(reset)
    }

    /// Return failed rows with fewer than `max_attempts` attempts to `pending`.
    pub async fn requeue_failed(&self, max_attempts: u32) -> Result<u64> {
        Ok(self.repository.requeue_failed(max_attempts).await?)
    }

    /// Delete sent rows older than `retention_days`.
    pub async fn cleanup(&self, retention_days: u64) -> Result<u64> {
        let cutoff = Utc::now() - minutes(retention_days.saturating_mul(24 * 60));
        let removed = self.repository.cleanup(cutoff).await?;
        if removed > 0 {
            info!(count = removed, "Cleaned up outbox events");
        }
        Ok(removed)
    }

    pub async fn stats(&self) -> Result<OutboxStats> {
        Ok(self.repository.count_by_status().await?)
    }
}

/// Send function that provisions the subject's stream and publishes with the event id
/// as broker message id.
pub fn broker_send_fn(broker: Arc<dyn Broker>, topology: Arc<TopologyManager>) -> SendFn {
    Arc::new(move |event: OutboxEvent| -> BoxFuture<'static, std::result::Result<(), HandlerError>> {
        let broker = broker.clone();
        let topology = topology.clone();
        Box::pin(async move {
            topology.ensure_subject(&event.subject).await?;
            let options = PublishOptions {
                msg_id: Some(event.event_id.clone()),
                headers: event.headers,
            };
            let ack = broker
                .publish(&event.subject, Bytes::from(event.payload), options)
                .await?;
            debug!(
                event_id = %event.event_id,
                stream = %ack.stream,
                sequence = ack.sequence,
                duplicate = ack.duplicate,
                "Published"
            );
            Ok(())
        })
    })
}

// ============================================================================
// Sweeper
// ============================================================================

/// What one sweep did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub reset: u64,
    pub requeued: u64,
    pub batch: BatchReport,
    pub outbox_removed: u64,
    pub inbox_reset: u64,
    pub inbox_removed: u64,
}

/// Periodic outbox re-drive plus outbox and inbox maintenance.
pub struct OutboxSweeper {
    publisher: Arc<OutboxPublisher>,
    send: SendFn,
    config: OutboxConfig,
    inbox: Option<(Arc<InboxProcessor>, InboxConfig)>,
}

impl OutboxSweeper {
    pub fn new(publisher: Arc<OutboxPublisher>, send: SendFn, config: OutboxConfig) -> Self {
        Self {
            publisher,
            send,
            config,
            inbox: None,
        }
    }

    pub fn with_inbox(mut self, inbox: Arc<InboxProcessor>, config: InboxConfig) -> Self {
        self.inbox = Some((inbox, config));
        self
    }

    /// Run every maintenance step once. Step failures are logged and skipped.
    pub async fn run_once(&self) -> SweepReport {
        let mut report = SweepReport::default();
        let config = &self.config;

        match self.publisher.reset_stale(config.stale_timeout_minutes).await {
            Ok(n) => report.reset = n,
            Err(e) => error!(error = %e, "Outbox stale reset failed"),
        }
        match self.publisher.requeue_failed(config.max_attempts).await {
            Ok(n) => report.requeued = n,
            Err(e) => error!(error = %e, "Outbox requeue failed"),
        }
        let send = self.send.clone();
        match self
            .publisher
            .publish_pending(config.batch_size, |row| send(row))
            .await
        {
            Ok(batch) => report.batch = batch,
            Err(e) => error!(error = %e, "Outbox re-drive failed"),
        }
        match self.publisher.cleanup(config.retention_days).await {
            Ok(n) => report.outbox_removed = n,
            Err(e) => error!(error = %e, "Outbox cleanup failed"),
        }

        if let Some((inbox, inbox_config)) = &self.inbox {
            match inbox.reset_stale(inbox_config.stale_timeout_minutes).await {
                Ok(n) => report.inbox_reset = n,
                Err(e) => error!(error = %e, "Inbox stale reset failed"),
            }
            match inbox.cleanup(inbox_config.retention_days).await {
                Ok(n) => report.inbox_removed = n,
                Err(e) => error!(error = %e, "Inbox cleanup failed"),
            }
        }

        if !report.batch.failed.is_empty() {
            warn!(failed = report.batch.failed.len(), "Outbox sweep left failed events");
        }
        report
    }

    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.config.sweep_interval_secs.max(1))
    }
}

/// Handle to a running sweeper.
pub struct SweeperHandle {
    cancel: tokio::sync::watch::Sender<bool>,
    task: JoinHandle<()>,
}

impl SweeperHandle {
    /// Signal the sweeper to stop.
    pub fn stop(&self) {
        let _ = self.cancel.send(true);
    }

    /// Stop and wait for an in-progress sweep to finish.
    pub async fn shutdown(self) {
        self.stop();
        if let Err(e) = self.task.await {
            warn!(error = %e, "Outbox sweeper ended abnormally");
        }
    }
}

/// Spawn a background task that sweeps every `sweep_interval_secs`.
pub fn spawn_outbox_sweeper(sweeper: OutboxSweeper) -> SweeperHandle {
    let (cancel_tx, mut cancel_rx) = tokio::sync::watch::channel(false);
    let interval = sweeper.interval();

    let task = tokio::spawn(async move {
        info!(
            interval_secs = interval.as_secs(),
            "Outbox sweeper started"
        );

        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    sweeper.run_once().await;
                }
                changed = cancel_rx.changed() => {
                    if changed.is_err() || *cancel_rx.borrow() {
                        info!("Outbox sweeper stopped");
                        break;
                    }
                }
            }
        }
    });

    SweeperHandle {
        cancel: cancel_tx,
        task,
    }
}

#[cfg(test)]
mod tests;
