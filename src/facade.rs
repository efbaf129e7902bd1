//! Courier facade: one entry point for publishing, subscribing and DLQ operations.
//!
//! ```no_run
//! use std::sync::Arc;
//! use courier::{handler_fn, Config, Courier, MemoryBroker, MessageOptions};
//!
//! # async fn run() -> Result<(), courier::CourierError> {
//! let courier = Courier::builder(Config::default())
//!     .broker(Arc::new(MemoryBroker::new()))
//!     .build()?;
//!
//! courier.subscribe("development.app.order.*", handler_fn(|message| async move {
//!     tracing::info!(subject = %message.subject, "received");
//!     Ok::<_, courier::HandlerError>(())
//! }))?;
//! courier.start().await?;
//!
//! courier
//!     .publish("order.created", &serde_json::json!({"id": 1}), MessageOptions::default())
//!     .await?;
//! courier.stop().await?;
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast::{self, error::RecvError};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::broker::{
    Broker, BrokerAdmin, BrokerError, ConnectionEvent, PublishAck, PublishOptions,
};
use crate::config::{Config, ConfigError};
use crate::consumer::{
    ConsumerDescriptor, ConsumerEngine, ConsumerError, ConsumerHandle, HandlerError,
    MessageHandler, Middleware, Subscription,
};
use crate::dlq::{DlqEntry, DlqStore};
use crate::envelope::{Envelope, EVENT_ID_HEADER, MSG_ID_HEADER, TRACE_ID_HEADER};
use crate::inbox::{InboxError, InboxProcessor};
use crate::outbox::{
    broker_send_fn, spawn_outbox_sweeper, OutboxError, OutboxPublisher, OutboxSweeper,
    PublishOutcome, SendFn, SweeperHandle,
};
use crate::repository::memory::{MemoryInboxRepository, MemoryOutboxRepository};
use crate::repository::{
    InboxRepository, InboxStats, NewOutboxEvent, OutboxEvent, OutboxRepository, OutboxStats,
};
use crate::subject;
use crate::topology::{TopologyError, TopologyManager};

#[derive(Debug, thiserror::Error)]
pub enum CourierError {
    #[error("Invalid subject: '{0}'")]
    InvalidSubject(String),

    #[error("No broker configured")]
    MissingBroker,

    #[error("Courier already started")]
    AlreadyStarted,

    #[error("Broker not ready after {0:?}")]
    NotReady(Duration),

    #[error("DLQ entry not found: {0}")]
    DlqEntryNotFound(Uuid),

    #[error("Payload serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Send failed: {0}")]
    Send(HandlerError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Topology(#[from] TopologyError),

    #[error(transparent)]
    Consumer(#[from] ConsumerError),

    #[error(transparent)]
    Outbox(#[from] OutboxError),

    #[error(transparent)]
    Inbox(#[from] InboxError),
}

pub type Result<T> = std::result::Result<T, CourierError>;

/// Per-publish options.
#[derive(Debug, Clone, Default)]
pub struct MessageOptions {
    /// Defaults to a fresh UUID.
    pub event_id: Option<String>,
    pub trace_id: Option<String>,
    pub schema_version: Option<u32>,
    pub headers: HashMap<String, String>,
}

impl MessageOptions {
    pub fn with_event_id(mut self, event_id: impl Into<String>) -> Self {
        self.event_id = Some(event_id.into());
        self
    }

    pub fn with_trace_id(mut self, trace_id: impl Into<String>) -> Self {
        self.trace_id = Some(trace_id.into());
        self
    }

    pub fn with_schema_version(mut self, version: u32) -> Self {
        self.schema_version = Some(version);
        self
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

/// What a publish did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishReceipt {
    pub event_id: String,
    pub subject: String,
    pub outcome: PublishOutcome,
}

// ============================================================================
// Builder
// ============================================================================

pub struct CourierBuilder {
    config: Config,
    broker: Option<Arc<dyn Broker>>,
    admin: Option<Arc<dyn BrokerAdmin>>,
    outbox: Option<Arc<dyn OutboxRepository>>,
    inbox: Option<Arc<dyn InboxRepository>>,
    middleware: Vec<Arc<dyn Middleware>>,
}

impl CourierBuilder {
    pub fn broker<B>(mut self, broker: Arc<B>) -> Self
    where
        B: Broker + BrokerAdmin + 'static,
    {
        self.broker = Some(broker.clone());
        self.admin = Some(broker);
        self
    }

    /// Defaults to an in-memory repository when the outbox is enabled.
    pub fn outbox_repository(mut self, repository: Arc<dyn OutboxRepository>) -> Self {
        self.outbox = Some(repository);
        self
    }

    /// Defaults to an in-memory repository when the inbox is enabled.
    pub fn inbox_repository(mut self, repository: Arc<dyn InboxRepository>) -> Self {
        self.inbox = Some(repository);
        self
    }

    /// Middleware applied to every subscriber, outermost first.
    pub fn middleware(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.middleware.push(middleware);
        self
    }

    pub fn build(self) -> Result<Courier> {
        self.config.validate()?;
        let (Some(broker), Some(admin)) = (self.broker, self.admin) else {
            return Err(CourierError::MissingBroker);
        };
        let config = Arc::new(self.config);

        let topology = Arc::new(
            TopologyManager::new(admin, config.stream.name.clone())
                .with_max_age(config.stream.max_age())
                .with_replicas(config.stream.replicas),
        );

        let outbox = config.outbox.enabled.then(|| {
            let repository = self
                .outbox
                .unwrap_or_else(|| Arc::new(MemoryOutboxRepository::new()));
            Arc::new(
                OutboxPublisher::new(repository)
                    .with_stale_timeout_minutes(config.outbox.stale_timeout_minutes),
            )
        });
        let inbox = config.inbox.enabled.then(|| {
            let repository = self
                .inbox
                .unwrap_or_else(|| Arc::new(MemoryInboxRepository::new()));
            Arc::new(
                InboxProcessor::new(repository)
                    .with_stale_timeout_minutes(config.inbox.stale_timeout_minutes),
            )
        });

        Ok(Courier {
            send: broker_send_fn(broker.clone(), topology.clone()),
            dlq: Arc::new(DlqStore::new(config.dlq.capacity)),
            middleware: self.middleware,
            lifecycle: Mutex::new(Lifecycle::Idle(Vec::new())),
            broker,
            topology,
            outbox,
            inbox,
            config,
        })
    }
}

// ============================================================================
// Courier
// ============================================================================

struct Running {
    consumers: ConsumerHandle,
    sweeper: Option<SweeperHandle>,
    monitor: JoinHandle<()>,
}

enum Lifecycle {
    Idle(Vec<Subscription>),
    Starting,
    Running(Running),
    Stopped,
}

pub struct Courier {
    config: Arc<Config>,
    broker: Arc<dyn Broker>,
    topology: Arc<TopologyManager>,
    outbox: Option<Arc<OutboxPublisher>>,
    inbox: Option<Arc<InboxProcessor>>,
    dlq: Arc<DlqStore>,
    send: SendFn,
    middleware: Vec<Arc<dyn Middleware>>,
    lifecycle: Mutex<Lifecycle>,
}

impl Courier {
    pub fn builder(config: Config) -> CourierBuilder {
        CourierBuilder {
            config,
            broker: None,
            admin: None,
            outbox: None,
            inbox: None,
            middleware: Vec::new(),
        }
    }

    /// Connect to NATS and build with in-memory repositories.
    #[cfg(feature = "nats")]
    pub async fn connect(config: Config) -> Result<Courier> {
        let broker = crate::broker::NatsBroker::connect(&config.broker).await?;
        Self::builder(config).broker(Arc::new(broker)).build()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn topology(&self) -> &Arc<TopologyManager> {
        &self.topology
    }

    pub fn outbox(&self) -> Option<&Arc<OutboxPublisher>> {
        self.outbox.as_ref()
    }

    pub fn inbox(&self) -> Option<&Arc<InboxProcessor>> {
        self.inbox.as_ref()
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.lifecycle.lock().unwrap_or_else(|e| e.into_inner())
    }

    // ------------------------------------------------------------------------
    // Publishing
    // ------------------------------------------------------------------------

    /// Publish to `<env>.<app>.<topic>`.
    pub async fn publish<T: Serialize>(
        &self,
        topic: &str,
        payload: &T,
        options: MessageOptions,
    ) -> Result<PublishReceipt> {
        let subject = subject::build_topic(&self.config.env, &self.config.app_name, topic);
        self.publish_to(subject, payload, options).await
    }

    /// Publish to `<env>.<domain>.<resource>.<action>`.
    pub async fn publish_event<T: Serialize>(
        &self,
        domain: &str,
        resource: &str,
        action: &str,
        payload: &T,
        options: MessageOptions,
    ) -> Result<PublishReceipt> {
        let subject = subject::build_event(&self.config.env, domain, resource, action);
        self.publish_to(subject, payload, options).await
    }

    #[tracing::instrument(skip_all, fields(subject = %subject))]
    async fn publish_to<T: Serialize>(
        &self,
        subject: String,
        payload: &T,
        options: MessageOptions,
    ) -> Result<PublishReceipt> {
        if !subject::is_valid(&subject) || subject::has_wildcard(&subject) {
            return Err(CourierError::InvalidSubject(subject));
        }

        let mut envelope = Envelope::new(self.config.app_name.clone(), serde_json::to_value(payload)?);
        if let Some(event_id) = options.event_id {
            envelope = envelope.with_event_id(event_id);
        }
        if let Some(trace_id) = options.trace_id {
            envelope = envelope.with_trace_id(trace_id);
        }
        if let Some(version) = options.schema_version {
            envelope = envelope.with_schema_version(version);
        }

        let mut event = NewOutboxEvent::new(envelope.event_id.clone(), subject.clone(), envelope.to_bytes()?);
        event.headers = options.headers;
        event
            .headers
            .insert(EVENT_ID_HEADER.to_string(), envelope.event_id.clone());
        if let Some(trace_id) = &envelope.trace_id {
            event.headers.insert(TRACE_ID_HEADER.to_string(), trace_id.clone());
        }

        let outcome = match &self.outbox {
            Some(outbox) => outbox.publish(event, |row| (self.send)(row)).await?,
            None => {
                (self.send)(OutboxEvent::from_new(event, chrono::Utc::now()))
                    .await
                    .map_err(CourierError::Send)?;
                PublishOutcome::Sent
            }
        };

        info!(event_id = %envelope.event_id, ?outcome, "Published event");
        Ok(PublishReceipt {
            event_id: envelope.event_id,
            subject,
            outcome,
        })
    }

    // ------------------------------------------------------------------------
    // Subscribing
    // ------------------------------------------------------------------------

    /// Register a handler for a descriptor. Only allowed before [`start`](Self::start).
    pub fn register_subscriber(
        &self,
        descriptor: ConsumerDescriptor,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<()> {
        self.register(Subscription::new(descriptor, handler))
    }

    /// Register a handler for a subject pattern with the configured consumer defaults.
    pub fn subscribe(
        &self,
        subject_pattern: &str,
        handler: Arc<dyn MessageHandler>,
    ) -> Result<ConsumerDescriptor> {
        let descriptor = ConsumerDescriptor::from_config(
            &self.config.app_name,
            subject_pattern,
            &self.config.consumer,
        );
        self.register_subscriber(descriptor.clone(), handler)?;
        Ok(descriptor)
    }

    /// Register a fully configured subscription (breaker, extra middleware).
    pub fn register(&self, subscription: Subscription) -> Result<()> {
        let pattern = &subscription.descriptor.subject_pattern;
        if !subject::is_valid(pattern) {
            return Err(CourierError::InvalidSubject(pattern.clone()));
        }
        match &mut *self.lifecycle() {
            Lifecycle::Idle(subscriptions) => {
                info!(
                    subject = %pattern,
                    durable = %subscription.descriptor.durable_name,
                    "Registered subscriber"
                );
                subscriptions.push(subscription);
                Ok(())
            }
            _ => Err(CourierError::AlreadyStarted),
        }
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Wait for the broker, provision topology and start consumers and the sweeper.
    pub async fn start(&self) -> Result<()> {
        let previous = std::mem::replace(&mut *self.lifecycle(), Lifecycle::Starting);
        let subscriptions = match previous {
            Lifecycle::Idle(subscriptions) => subscriptions,
            other => {
                *self.lifecycle() = other;
                return Err(CourierError::AlreadyStarted);
            }
        };

        if let Err(e) = self.wait_ready().await {
            *self.lifecycle() = Lifecycle::Idle(subscriptions);
            return Err(e);
        }

        let mut engine = ConsumerEngine::new(self.broker.clone(), self.topology.clone(), self.dlq.clone());
        if let Some(inbox) = &self.inbox {
            engine = engine.with_inbox(inbox.clone());
        }
        for middleware in &self.middleware {
            engine = engine.with_middleware(middleware.clone());
        }
        for subscription in subscriptions {
            engine.subscribe(subscription);
        }

        let consumers = match engine.start().await {
            Ok(handle) => handle,
            Err(e) => {
                error!(error = %e, "Consumer startup failed");
                *self.lifecycle() = Lifecycle::Stopped;
                return Err(e.into());
            }
        };

        let sweeper = self.outbox.as_ref().map(|outbox| {
            let mut sweeper = OutboxSweeper::new(outbox.clone(), self.send.clone(), self.config.outbox.clone());
            if let Some(inbox) = &self.inbox {
                sweeper = sweeper.with_inbox(inbox.clone(), self.config.inbox.clone());
            }
            spawn_outbox_sweeper(sweeper)
        });
        let monitor = spawn_connection_monitor(self.broker.connection_events());

        info!(
            env = %self.config.env,
            app = %self.config.app_name,
            workers = consumers.worker_count(),
            "Courier started"
        );
        *self.lifecycle() = Lifecycle::Running(Running {
            consumers,
            sweeper,
            monitor,
        });
        Ok(())
    }

    async fn wait_ready(&self) -> Result<()> {
        let mut events = self.broker.connection_events();
        let timeout = Duration::from_millis(self.config.broker.readiness_timeout_ms);

        let ready = tokio::time::timeout(timeout, async {
            loop {
                if self.broker.is_connected() {
                    return true;
                }
                match events.recv().await {
                    Ok(ConnectionEvent::Connected | ConnectionEvent::Reconnected) => return true,
                    Ok(ConnectionEvent::Closed) | Err(RecvError::Closed) => return false,
                    Ok(_) | Err(RecvError::Lagged(_)) => {}
                }
            }
        })
        .await;

        match ready {
            Ok(true) => Ok(()),
            _ => {
                warn!(timeout_ms = timeout.as_millis() as u64, "Broker not ready");
                Err(CourierError::NotReady(timeout))
            }
        }
    }

    /// Stop the sweeper and consumers, then drain the broker. A no-op unless running.
    pub async fn stop(&self) -> Result<()> {
        let previous = std::mem::replace(&mut *self.lifecycle(), Lifecycle::Stopped);
        let running = match previous {
            Lifecycle::Running(running) => running,
            other => {
                *self.lifecycle() = other;
                return Ok(());
            }
        };

        if let Some(sweeper) = running.sweeper {
            sweeper.shutdown().await;
        }
        let drained = running
            .consumers
            .stop(self.config.consumer.shutdown_grace())
            .await;
        running.monitor.abort();

        info!("Courier stopped");
        drained?;
        Ok(())
    }

    pub fn is_running(&self) -> bool {
        matches!(*self.lifecycle(), Lifecycle::Running(_))
    }

    // ------------------------------------------------------------------------
    // DLQ and stats
    // ------------------------------------------------------------------------

    pub fn dlq(&self) -> &Arc<DlqStore> {
        &self.dlq
    }

    /// Quarantined messages, oldest first.
    pub fn dlq_list(&self) -> Vec<DlqEntry> {
        self.dlq.list()
    }

    /// Republish a DLQ entry to its original subject under a fresh broker message id.
    ///
    /// The entry is removed on success and put back if the publish fails.
    pub async fn dlq_retry(&self, id: Uuid) -> Result<PublishAck> {
        let entry = self.dlq.take(id).ok_or(CourierError::DlqEntryNotFound(id))?;
        match self.republish(&entry).await {
            Ok(ack) => {
                info!(
                    dlq_id = %id,
                    subject = %entry.subject,
                    sequence = ack.sequence,
                    "Retried DLQ entry"
                );
                Ok(ack)
            }
            Err(e) => {
                warn!(dlq_id = %id, error = %e, "DLQ retry failed, entry restored");
                if let Some(evicted) = self.dlq.restore(entry) {
                    if evicted.id == id {
                        error!(dlq_id = %id, "DLQ has no capacity, retried entry dropped");
                    }
                }
                Err(e)
            }
        }
    }

    async fn republish(&self, entry: &DlqEntry) -> Result<PublishAck> {
        self.topology.ensure_subject(&entry.subject).await?;
        let mut headers = entry.headers.clone();
        headers.remove(MSG_ID_HEADER);
        let options = PublishOptions {
            msg_id: Some(Uuid::new_v4().to_string()),
            headers,
        };
        Ok(self
            .broker
            .publish(&entry.subject, entry.payload.clone(), options)
            .await?)
    }

    /// Drop a DLQ entry. Returns whether it existed.
    pub fn dlq_discard(&self, id: Uuid) -> bool {
        let removed = self.dlq.discard(id);
        if removed {
            info!(dlq_id = %id, "Discarded DLQ entry");
        }
        removed
    }

    /// Outbox row counts, or `None` when the outbox is disabled.
    pub async fn outbox_stats(&self) -> Result<Option<OutboxStats>> {
        match &self.outbox {
            Some(outbox) => Ok(Some(outbox.stats().await?)),
            None => Ok(None),
        }
    }

    /// Inbox row counts, or `None` when the inbox is disabled.
    pub async fn inbox_stats(&self) -> Result<Option<InboxStats>> {
        match &self.inbox {
            Some(inbox) => Ok(Some(inbox.stats().await?)),
            None => Ok(None),
        }
    }
}

fn spawn_connection_monitor(mut events: broadcast::Receiver<ConnectionEvent>) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(ConnectionEvent::Connected) => info!("Broker connected"),
                Ok(ConnectionEvent::Reconnected) => info!("Broker reconnected"),
                Ok(ConnectionEvent::Disconnected) => warn!("Broker disconnected"),
                Ok(ConnectionEvent::Error(e)) => error!(error = %e, "Broker connection error"),
                Ok(ConnectionEvent::Closed) | Err(RecvError::Closed) => {
                    info!("Broker connection closed");
                    break;
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!(skipped, "Connection monitor lagged");
                }
            }
        }
    })
}
