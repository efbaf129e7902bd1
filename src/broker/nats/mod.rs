//! NATS JetStream broker.
//!
//! Connects with `async-nats`, publishes through the JetStream context with the
//! `Nats-Msg-Id` header set so the server's duplicate window applies, and pulls
//! from durable consumers with explicit acknowledgement.
//!
//! # Configuration
//!
//! ```yaml
//! broker:
//!   urls: ["nats://localhost:4222"]
//!   user: courier
//!   password: secret
//!   require_tls: false
//!   connect_timeout_ms: 5000
//! ```

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_nats::jetstream::consumer::{pull, AckPolicy, PullConsumer};
use async_nats::jetstream::context::PublishErrorKind;
use async_nats::jetstream::{self, AckKind};
use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};

use super::{
    Acker, ApiError, ApiErrorCode, Broker, BrokerAdmin, BrokerError, ConnectionEvent, ConsumerSpec,
    PublishAck, PublishOptions, RawMessage, Result, StreamSpec,
};
use crate::config::BrokerConfig;
use crate::envelope::MSG_ID_HEADER;

const EVENT_CHANNEL_CAPACITY: usize = 64;

/// Convert a client error into an API error, recovering status and code from the text.
///
/// async-nats renders JetStream errors as `... (code 404, error code 10059)`.
fn api_error(err: impl fmt::Display) -> BrokerError {
    let description = err.to_string();
    let number_after = |marker: &str| -> Option<u64> {
        let start = description.find(marker)? + marker.len();
        let digits: String = description[start..]
            .chars()
            .take_while(|c| c.is_ascii_digit())
            .collect();
        digits.parse().ok()
    };
    let code = number_after("error code ").map(ApiErrorCode::Numeric);
    let status = number_after("(code ").and_then(|c| u16::try_from(c).ok());
    BrokerError::Api(ApiError::new(status, code, description))
}

/// JetStream-backed broker.
pub struct NatsBroker {
    client: async_nats::Client,
    jetstream: jetstream::Context,
    events: broadcast::Sender<ConnectionEvent>,
}

impl NatsBroker {
    /// Connect to the configured servers.
    pub async fn connect(config: &BrokerConfig) -> Result<Self> {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let sender = events.clone();

        let mut options = async_nats::ConnectOptions::new()
            .connection_timeout(Duration::from_millis(config.connect_timeout_ms))
            .require_tls(config.require_tls)
            .event_callback(move |event| {
                let sender = sender.clone();
                async move {
                    let mapped = match event {
                        async_nats::Event::Connected => ConnectionEvent::Connected,
                        async_nats::Event::Disconnected => ConnectionEvent::Disconnected,
                        async_nats::Event::Closed => ConnectionEvent::Closed,
                        other => ConnectionEvent::Error(other.to_string()),
                    };
                    let _ = sender.send(mapped);
                }
            });

        if let Some(name) = &config.client_name {
            options = options.name(name);
        }
        if let (Some(user), Some(password)) = (&config.user, &config.password) {
            options = options.user_and_password(user.clone(), password.clone());
        } else if let Some(token) = &config.token {
            options = options.token(token.clone());
        }

        let urls = config.urls.join(",");
        let client = async_nats::connect_with_options(urls.as_str(), options)
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;
        let jetstream = jetstream::new(client.clone());

        info!(urls = %urls, "Connected to NATS JetStream");

        Ok(Self {
            client,
            jetstream,
            events,
        })
    }

    async fn stream(&self, name: &str) -> Result<jetstream::stream::Stream> {
        self.jetstream.get_stream(name).await.map_err(api_error)
    }
}

struct NatsAcker {
    message: jetstream::Message,
}

#[async_trait]
impl Acker for NatsAcker {
    async fn ack(&self) -> Result<()> {
        self.message
            .ack()
            .await
            .map_err(|e| BrokerError::Ack(e.to_string()))
    }

    async fn nak(&self, delay: Duration) -> Result<()> {
        self.message
            .ack_with(AckKind::Nak(Some(delay)))
            .await
            .map_err(|e| BrokerError::Ack(e.to_string()))
    }

    async fn term(&self) -> Result<()> {
        self.message
            .ack_with(AckKind::Term)
            .await
            .map_err(|e| BrokerError::Ack(e.to_string()))
    }
}

fn to_raw(stream: &str, message: jetstream::Message) -> Result<RawMessage> {
    let (stream_sequence, deliveries) = {
        let info = message
            .info()
            .map_err(|e| BrokerError::Pull(format!("missing delivery metadata: {}", e)))?;
        (info.stream_sequence, info.delivered)
    };

    let mut headers = HashMap::new();
    if let Some(map) = &message.headers {
        for (name, values) in map.iter() {
            if let Some(value) = values.first() {
                headers.insert(name.to_string(), value.as_str().to_string());
            }
        }
    }

    Ok(RawMessage {
        subject: message.subject.to_string(),
        payload: message.payload.clone(),
        headers,
        stream: stream.to_string(),
        stream_sequence,
        deliveries: u32::try_from(deliveries.max(1)).unwrap_or(u32::MAX),
        acker: Arc::new(NatsAcker { message }),
    })
}

#[async_trait]
impl Broker for NatsBroker {
    async fn publish(
        &self,
        subject: &str,
        payload: Bytes,
        options: PublishOptions,
    ) -> Result<PublishAck> {
        let mut headers = async_nats::HeaderMap::new();
        for (name, value) in &options.headers {
            headers.insert(name.as_str(), value.as_str());
        }
        if let Some(msg_id) = &options.msg_id {
            headers.insert(MSG_ID_HEADER, msg_id.as_str());
        }

        let ack = self
            .jetstream
            .publish_with_headers(subject.to_string(), headers, payload)
            .await
            .map_err(|e| BrokerError::Publish(e.to_string()))?
            .await
            .map_err(|e| match e.kind() {
                PublishErrorKind::StreamNotFound => BrokerError::NoStream(subject.to_string()),
                PublishErrorKind::TimedOut => BrokerError::Timeout,
                _ => BrokerError::Publish(e.to_string()),
            })?;

        if ack.duplicate {
            debug!(subject = %subject, sequence = ack.sequence, "Duplicate message id suppressed");
        }

        Ok(PublishAck {
            stream: ack.stream,
            sequence: ack.sequence,
            duplicate: ack.duplicate,
        })
    }

    async fn pull(
        &self,
        stream: &str,
        durable: &str,
        batch: usize,
        expires: Duration,
    ) -> Result<Vec<RawMessage>> {
        let consumer: PullConsumer = self
            .stream(stream)
            .await?
            .get_consumer(durable)
            .await
            .map_err(api_error)?;

        let mut messages = consumer
            .fetch()
            .max_messages(batch.max(1))
            .expires(expires)
            .messages()
            .await
            .map_err(|e| BrokerError::Pull(e.to_string()))?;

        let mut pulled = Vec::new();
        while let Some(message) = messages.next().await {
            match message {
                Ok(message) => pulled.push(to_raw(stream, message)?),
                Err(e) => {
                    warn!(stream = %stream, durable = %durable, error = %e, "Fetch interrupted");
                    break;
                }
            }
        }
        Ok(pulled)
    }

    async fn drain(&self) -> Result<()> {
        self.client
            .drain()
            .await
            .map_err(|e| BrokerError::Connection(e.to_string()))?;
        info!("NATS connection drained");
        Ok(())
    }

    fn is_connected(&self) -> bool {
        self.client.connection_state() == async_nats::connection::State::Connected
    }

    fn connection_events(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.events.subscribe()
    }
}

fn to_stream_spec(config: &jetstream::stream::Config) -> StreamSpec {
    StreamSpec {
        name: config.name.clone(),
        subjects: config.subjects.clone(),
        max_age: config.max_age,
        replicas: config.num_replicas,
    }
}

fn to_stream_config(spec: &StreamSpec) -> jetstream::stream::Config {
    jetstream::stream::Config {
        name: spec.name.clone(),
        subjects: spec.subjects.clone(),
        max_age: spec.max_age,
        num_replicas: spec.replicas.max(1),
        storage: jetstream::stream::StorageType::File,
        retention: jetstream::stream::RetentionPolicy::Limits,
        ..Default::default()
    }
}

#[async_trait]
impl BrokerAdmin for NatsBroker {
    async fn list_streams(&self) -> Result<Vec<StreamSpec>> {
        let mut specs = Vec::new();
        let mut streams = self.jetstream.streams();
        while let Some(info) = streams.next().await {
            let info = info.map_err(api_error)?;
            specs.push(to_stream_spec(&info.config));
        }
        Ok(specs)
    }

    async fn stream_info(&self, name: &str) -> Result<StreamSpec> {
        let mut stream = self.stream(name).await?;
        let info = stream.info().await.map_err(api_error)?;
        Ok(to_stream_spec(&info.config))
    }

    async fn create_stream(&self, spec: &StreamSpec) -> Result<()> {
        self.jetstream
            .create_stream(to_stream_config(spec))
            .await
            .map_err(api_error)?;
        info!(stream = %spec.name, subjects = ?spec.subjects, "Stream created");
        Ok(())
    }

    async fn update_stream(&self, spec: &StreamSpec) -> Result<()> {
        self.jetstream
            .update_stream(to_stream_config(spec))
            .await
            .map_err(api_error)?;
        info!(stream = %spec.name, subjects = ?spec.subjects, "Stream updated");
        Ok(())
    }

    async fn consumer_info(&self, stream: &str, durable: &str) -> Result<ConsumerSpec> {
        let stream = self.stream(stream).await?;
        let info = stream.consumer_info(durable).await.map_err(api_error)?;
        Ok(ConsumerSpec {
            durable_name: info.config.durable_name.unwrap_or_else(|| durable.to_string()),
            filter_subject: info.config.filter_subject,
            max_deliver: info.config.max_deliver,
            ack_wait: info.config.ack_wait,
        })
    }

    async fn create_consumer(&self, stream: &str, spec: &ConsumerSpec) -> Result<()> {
        let handle = self.stream(stream).await?;
        handle
            .create_consumer(pull::Config {
                durable_name: Some(spec.durable_name.clone()),
                filter_subject: spec.filter_subject.clone(),
                max_deliver: spec.max_deliver,
                ack_wait: spec.ack_wait,
                ack_policy: AckPolicy::Explicit,
                ..Default::default()
            })
            .await
            .map_err(api_error)?;
        info!(
            stream = %stream,
            durable = %spec.durable_name,
            filter = %spec.filter_subject,
            "Consumer provisioned"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_error_recovers_codes_from_text() {
        let err = api_error("jetstream error: stream not found (code 404, error code 10059)");
        match err {
            BrokerError::Api(api) => {
                assert_eq!(api.status, Some(404));
                assert_eq!(api.code, Some(ApiErrorCode::Numeric(10059)));
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn test_api_error_without_codes_still_classifies() {
        assert!(api_error("consumer not found").is_not_found());
        assert!(!api_error("timed out: didn't receive any message").is_not_found());
    }
}
