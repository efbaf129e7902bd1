//! Courier - reliable topic pub/sub over a persistent message log
//!
//! Publishers write through a transactional outbox, consumers dedupe through an
//! inbox, and messages that keep failing end up in a bounded dead letter store.
//! The broker is abstracted behind [`broker::Broker`]; an in-memory implementation
//! ships for tests and local development, NATS JetStream behind the `nats` feature.

pub mod broker;
pub mod config;
pub mod consumer;
pub mod dlq;
pub mod envelope;
pub mod facade;
pub mod inbox;
pub mod outbox;
pub mod repository;
pub mod subject;
pub mod topology;
pub mod utils;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_utils;

pub use broker::{Broker, BrokerAdmin, BrokerError, MemoryBroker, PublishAck, PublishOptions};
#[cfg(feature = "nats")]
pub use broker::NatsBroker;
pub use config::{Config, ConfigError};
pub use consumer::{
    handler_fn, CircuitBreaker, ConsecutiveFailureBreaker, ConsumerDescriptor, Delivery,
    HandlerError, HandlerResult, LoggingMiddleware, MessageHandler, Middleware, Next,
    Subscription,
};
pub use dlq::{DlqEntry, DlqStore};
pub use envelope::Envelope;
pub use facade::{Courier, CourierBuilder, CourierError, MessageOptions, PublishReceipt};
pub use inbox::{InboxOutcome, InboxProcessor};
pub use outbox::{OutboxPublisher, PublishOutcome};
pub use utils::bootstrap::init_tracing;
