//! Consumer engine: pull workers with retry, dead-lettering and ack discipline.
//!
//! Each registered subscription gets `concurrency` workers pulling batches from its
//! durable consumer. Every message ends in exactly one of:
//! - ack after the handler succeeds (or the inbox says it already did)
//! - nak with the configured backoff while deliveries remain
//! - DLQ entry then ack once `max_deliver` deliveries are used up
//!
//! Messages another worker is already processing are left unacknowledged so the
//! broker redelivers them after `ack_wait`.

mod breaker;
mod descriptor;
mod handler;
mod middleware;

pub use breaker::{BreakerState, CircuitBreaker, ConsecutiveFailureBreaker};
pub use descriptor::ConsumerDescriptor;
pub use handler::{handler_fn, Delivery, HandlerError, HandlerResult, MessageHandler};
pub use middleware::{compose, LoggingMiddleware, Middleware, Next};

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::broker::{Broker, BrokerError, RawMessage};
use crate::dlq::{DlqEntry, DlqStore};
use crate::inbox::{InboxError, InboxOutcome, InboxProcessor};
use crate::repository::NewInboxEvent;
use crate::topology::{TopologyError, TopologyManager};
use crate::utils::retry::PullBackoff;

#[derive(Debug, thiserror::Error)]
pub enum ConsumerError {
    #[error("Circuit breaker open")]
    CircuitOpen,

    #[error("Handler timed out after {0:?}")]
    Timeout(Duration),

    #[error(transparent)]
    Topology(#[from] TopologyError),
}

/// A handler bound to a consumer descriptor.
pub struct Subscription {
    pub descriptor: ConsumerDescriptor,
    handler: Arc<dyn MessageHandler>,
    middleware: Vec<Arc<dyn Middleware>>,
    breaker: Option<Arc<dyn CircuitBreaker>>,
}

impl Subscription {
    pub fn new(descriptor: ConsumerDescriptor, handler: Arc<dyn MessageHandler>) -> Self {
        Self {
            descriptor,
            handler,
            middleware: Vec::new(),
            breaker: None,
        }
    }

    /// Add a middleware layer inside any previously added ones.
    pub fn with_middleware(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.middleware.push(middleware);
        self
    }

    pub fn with_breaker(mut self, breaker: Arc<dyn CircuitBreaker>) -> Self {
        self.breaker = Some(breaker);
        self
    }
}

// ============================================================================
// Engine
// ============================================================================

pub struct ConsumerEngine {
    broker: Arc<dyn Broker>,
    topology: Arc<TopologyManager>,
    dlq: Arc<DlqStore>,
    inbox: Option<Arc<InboxProcessor>>,
    middleware: Vec<Arc<dyn Middleware>>,
    subscriptions: Vec<Subscription>,
}

impl ConsumerEngine {
    pub fn new(broker: Arc<dyn Broker>, topology: Arc<TopologyManager>, dlq: Arc<DlqStore>) -> Self {
        Self {
            broker,
            topology,
            dlq,
            inbox: None,
            middleware: Vec::new(),
            subscriptions: Vec::new(),
        }
    }

    /// Deduplicate deliveries through the inbox, separately for each subscription.
    pub fn with_inbox(mut self, inbox: Arc<InboxProcessor>) -> Self {
        self.inbox = Some(inbox);
        self
    }

    /// Middleware applied around every subscription, outside its own layers.
    pub fn with_middleware(mut self, middleware: Arc<dyn Middleware>) -> Self {
        self.middleware.push(middleware);
        self
    }

    pub fn subscribe(&mut self, subscription: Subscription) {
        self.subscriptions.push(subscription);
    }

    pub fn subscription_count(&self) -> usize {
        self.subscriptions.len()
    }

    /// Provision every consumer, then spawn the workers.
    ///
    /// Provisioning errors abort startup before any worker runs.
    pub async fn start(self) -> Result<ConsumerHandle, ConsumerError> {
        let mut streams = Vec::with_capacity(self.subscriptions.len());
        for subscription in &self.subscriptions {
            streams.push(self.topology.ensure_consumer(&subscription.descriptor).await?);
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        let mut tasks = JoinSet::new();

        for (subscription, stream) in self.subscriptions.into_iter().zip(streams) {
            let layers: Vec<Arc<dyn Middleware>> = self
                .middleware
                .iter()
                .chain(subscription.middleware.iter())
                .cloned()
                .collect();
            let worker = Arc::new(Worker {
                broker: self.broker.clone(),
                dlq: self.dlq.clone(),
                inbox: self
                    .inbox
                    .as_ref()
                    .map(|inbox| Arc::new(inbox.for_consumer(&subscription.descriptor.durable_name))),
                handler: compose(&layers, subscription.handler),
                breaker: subscription.breaker,
                descriptor: subscription.descriptor,
                stream,
            });

            info!(
                subject = %worker.descriptor.subject_pattern,
                durable = %worker.descriptor.durable_name,
                stream = %worker.stream,
                concurrency = worker.descriptor.concurrency,
                "Starting consumer"
            );
            for _ in 0..worker.descriptor.concurrency {
                tasks.spawn(run_worker(worker.clone(), stop_rx.clone()));
            }
        }

        Ok(ConsumerHandle {
            stop: stop_tx,
            tasks,
            broker: self.broker,
        })
    }
}

/// Running workers.
pub struct ConsumerHandle {
    stop: watch::Sender<bool>,
    tasks: JoinSet<()>,
    broker: Arc<dyn Broker>,
}

impl ConsumerHandle {
    pub fn worker_count(&self) -> usize {
        self.tasks.len()
    }

    /// Stop pulling, wait up to `grace` for in-flight handlers, then drain the broker.
    ///
    /// Workers still busy after `grace` are aborted; their messages stay unacked and
    /// are redelivered.
    pub async fn stop(mut self, grace: Duration) -> Result<(), BrokerError> {
        let _ = self.stop.send(true);

        let tasks = &mut self.tasks;
        let finished = tokio::time::timeout(grace, async {
            while tasks.join_next().await.is_some() {}
        })
        .await;

        if finished.is_err() {
            warn!(
                remaining = self.tasks.len(),
                grace_ms = grace.as_millis() as u64,
                "Shutdown grace elapsed, aborting workers"
            );
            self.tasks.abort_all();
            while self.tasks.join_next().await.is_some() {}
        }

        self.broker.drain().await
    }
}

// ============================================================================
// Workers
// ============================================================================

struct Worker {
    broker: Arc<dyn Broker>,
    dlq: Arc<DlqStore>,
    inbox: Option<Arc<InboxProcessor>>,
    handler: Arc<dyn MessageHandler>,
    breaker: Option<Arc<dyn CircuitBreaker>>,
    descriptor: ConsumerDescriptor,
    stream: String,
}

async fn run_worker(worker: Arc<Worker>, mut stop: watch::Receiver<bool>) {
    let mut backoff = PullBackoff::new();

    loop {
        if *stop.borrow() {
            break;
        }

        let pulled = tokio::select! {
            _ = stop.changed() => break,
            pulled = worker.broker.pull(
                &worker.stream,
                &worker.descriptor.durable_name,
                worker.descriptor.batch_size,
                worker.descriptor.pull_expires,
            ) => pulled,
        };

        match pulled {
            Ok(messages) => {
                backoff.reset();
                for message in messages {
                    if *stop.borrow() {
                        break;
                    }
                    worker.process(message).await;
                }
            }
            Err(e) => {
                let delay = backoff.next_delay();
                warn!(
                    durable = %worker.descriptor.durable_name,
                    error = %e,
                    backoff_ms = delay.as_millis() as u64,
                    "Pull failed, retrying after backoff"
                );
                tokio::select! {
                    _ = stop.changed() => break,
                    _ = tokio::time::sleep(delay) => {}
                }
            }
        }
    }

    debug!(durable = %worker.descriptor.durable_name, "Worker stopped");
}

impl Worker {
    #[tracing::instrument(
        skip_all,
        fields(
            subject = %message.subject,
            sequence = message.stream_sequence,
            deliveries = message.deliveries
        )
    )]
    async fn process(&self, message: RawMessage) {
        let delivery = Arc::new(Delivery::from_raw(&message, &self.descriptor.durable_name));

        let result = match &self.inbox {
            Some(inbox) => {
                let event = NewInboxEvent {
                    consumer: self.descriptor.durable_name.clone(),
                    event_id: delivery.event_id().map(str::to_string),
                    stream: message.stream.clone(),
                    stream_seq: message.stream_sequence,
                    subject: message.subject.clone(),
                    payload: message.payload.to_vec(),
                };
                match inbox
                    .process_outcome(event, |_, delivery| self.invoke(delivery), delivery.clone())
                    .await
                {
                    Ok(InboxOutcome::InFlight) => {
                        debug!(
                            subject = %message.subject,
                            sequence = message.stream_sequence,
                            "Message in flight elsewhere, leaving unacked"
                        );
                        return;
                    }
                    Ok(_) => Ok(()),
                    Err(InboxError::Handler(e)) => Err(e),
                    Err(InboxError::Storage(e)) => Err(e.into()),
                }
            }
            None => self.invoke(delivery.clone()).await,
        };

        match result {
            Ok(()) => self.settle(self.broker.ack(&message).await, &message, "ack"),
            Err(e) => self.fail(&message, &delivery, e).await,
        }
    }

    async fn invoke(&self, delivery: Arc<Delivery>) -> HandlerResult {
        if let Some(breaker) = &self.breaker {
            if !breaker.try_acquire() {
                return Err(Box::new(ConsumerError::CircuitOpen));
            }
        }

        let timeout = self.descriptor.handler_timeout;
        let result = match tokio::time::timeout(timeout, self.handler.handle(delivery)).await {
            Ok(result) => result,
            Err(_) => Err(Box::new(ConsumerError::Timeout(timeout)) as HandlerError),
        };

        if let Some(breaker) = &self.breaker {
            match &result {
                Ok(()) => breaker.on_success(),
                Err(_) => breaker.on_failure(),
            }
        }
        result
    }

    async fn fail(&self, message: &RawMessage, delivery: &Delivery, err: HandlerError) {
        let max_deliver = self.descriptor.max_deliver;

        if message.deliveries < max_deliver {
            let delay = self.descriptor.backoff_for(message.deliveries.saturating_sub(1));
            warn!(
                subject = %message.subject,
                durable = %self.descriptor.durable_name,
                deliveries = message.deliveries,
                max_deliver,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Handler failed, scheduling redelivery"
            );
            self.settle(self.broker.nak(message, delay).await, message, "nak");
            return;
        }

        error!(
            subject = %message.subject,
            durable = %self.descriptor.durable_name,
            deliveries = message.deliveries,
            error = %err,
            "Delivery attempts exhausted, moving message to DLQ"
        );
        let entry = DlqEntry::new(
            message.subject.clone(),
            message.payload.clone(),
            err.to_string(),
            message.deliveries,
        )
        .with_event_id(delivery.event_id().map(str::to_string))
        .with_consumer(self.descriptor.durable_name.clone())
        .with_headers(message.headers.clone());
        self.dlq.push(entry);

        self.settle(self.broker.ack(message).await, message, "ack");
    }

    fn settle(&self, result: Result<(), BrokerError>, message: &RawMessage, action: &str) {
        if let Err(e) = result {
            error!(
                subject = %message.subject,
                sequence = message.stream_sequence,
                action,
                error = %e,
                "Failed to settle message"
            );
        }
    }
}
