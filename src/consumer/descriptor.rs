//! Per-subscriber consumer settings.

use std::time::Duration;

use crate::broker::ConsumerSpec;
use crate::config::ConsumerConfig;
use crate::subject;

/// Everything needed to provision and run one subscriber.
///
/// The durable name is derived from the application and subject pattern, so a
/// restarted process resumes the same broker-side position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConsumerDescriptor {
    pub subject_pattern: String,
    pub durable_name: String,
    /// Total deliveries before the message is dead-lettered.
    pub max_deliver: u32,
    pub ack_wait: Duration,
    /// Redelivery delays. The last entry repeats; empty means redeliver immediately.
    pub backoff: Vec<Duration>,
    pub concurrency: usize,
    pub batch_size: usize,
    pub pull_expires: Duration,
    pub handler_timeout: Duration,
}

impl ConsumerDescriptor {
    /// Descriptor with library defaults.
    pub fn new(app_name: &str, subject_pattern: impl Into<String>) -> Self {
        Self::from_config(app_name, subject_pattern, &ConsumerConfig::default())
    }

    /// Descriptor with the configured consumer defaults.
    pub fn from_config(
        app_name: &str,
        subject_pattern: impl Into<String>,
        config: &ConsumerConfig,
    ) -> Self {
        let subject_pattern = subject_pattern.into();
        Self {
            durable_name: subject::durable_name(app_name, &subject_pattern),
            subject_pattern,
            max_deliver: config.max_deliver.max(1),
            ack_wait: config.ack_wait(),
            backoff: config.backoff(),
            concurrency: config.concurrency.max(1),
            batch_size: config.batch_size.max(1),
            pull_expires: config.pull_expires(),
            handler_timeout: config.subscriber_timeout(),
        }
    }

    pub fn with_durable_name(mut self, durable_name: impl Into<String>) -> Self {
        self.durable_name = durable_name.into();
        self
    }

    pub fn with_max_deliver(mut self, max_deliver: u32) -> Self {
        self.max_deliver = max_deliver.max(1);
        self
    }

    pub fn with_ack_wait(mut self, ack_wait: Duration) -> Self {
        self.ack_wait = ack_wait;
        self
    }

    pub fn with_backoff(mut self, backoff: Vec<Duration>) -> Self {
        self.backoff = backoff;
        self
    }

    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = concurrency.max(1);
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size.max(1);
        self
    }

    pub fn with_pull_expires(mut self, pull_expires: Duration) -> Self {
        self.pull_expires = pull_expires;
        self
    }

    pub fn with_handler_timeout(mut self, handler_timeout: Duration) -> Self {
        self.handler_timeout = handler_timeout;
        self
    }

    /// Redelivery delay after `prior_failures` earlier failed deliveries.
    pub fn backoff_for(&self, prior_failures: u32) -> Duration {
        match self.backoff.len() {
            0 => Duration::ZERO,
            len => self.backoff[(prior_failures as usize).min(len - 1)],
        }
    }

    /// Broker-side definition of the durable consumer.
    pub fn consumer_spec(&self) -> ConsumerSpec {
        ConsumerSpec {
            durable_name: self.durable_name.clone(),
            filter_subject: self.subject_pattern.clone(),
            max_deliver: i64::from(self.max_deliver),
            ack_wait: self.ack_wait,
        }
    }
}
