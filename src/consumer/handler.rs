//! Subscriber handlers and the message they receive.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use bytes::Bytes;
use futures::future::BoxFuture;
use serde::de::DeserializeOwned;

use crate::broker::RawMessage;
use crate::envelope::{Envelope, EVENT_ID_HEADER, MSG_ID_HEADER};

/// Error returned by a subscriber handler.
pub type HandlerError = Box<dyn std::error::Error + Send + Sync>;

/// Result of handling one message.
pub type HandlerResult = Result<(), HandlerError>;

/// A delivered message as seen by handlers and middleware.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub subject: String,
    /// Envelope payload, or the body parsed as JSON when it carried no envelope.
    pub payload: serde_json::Value,
    /// Body exactly as received.
    pub raw: Bytes,
    pub envelope: Option<Envelope>,
    pub headers: HashMap<String, String>,
    pub stream: String,
    pub stream_sequence: u64,
    /// Delivery count, starting at 1.
    pub deliveries: u32,
    /// Durable name of the consumer that pulled it.
    pub consumer: String,
}

impl Delivery {
    pub fn from_raw(message: &RawMessage, consumer: &str) -> Self {
        let envelope = Envelope::from_bytes(&message.payload).ok();
        let payload = match &envelope {
            Some(envelope) => envelope.payload.clone(),
            None => serde_json::from_slice(&message.payload).unwrap_or(serde_json::Value::Null),
        };
        Self {
            subject: message.subject.clone(),
            payload,
            raw: message.payload.clone(),
            envelope,
            headers: message.headers.clone(),
            stream: message.stream.clone(),
            stream_sequence: message.stream_sequence,
            deliveries: message.deliveries,
            consumer: consumer.to_string(),
        }
    }

    /// Logical event id: from the envelope, else the event-id or message-id header.
    pub fn event_id(&self) -> Option<&str> {
        self.envelope
            .as_ref()
            .map(|e| e.event_id.as_str())
            .or_else(|| self.headers.get(EVENT_ID_HEADER).map(String::as_str))
            .or_else(|| self.headers.get(MSG_ID_HEADER).map(String::as_str))
    }

    /// Deserialize the payload into a concrete type.
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_value(self.payload.clone())
    }
}

/// Handler for messages delivered to a subscriber.
pub trait MessageHandler: Send + Sync {
    fn handle(&self, message: Arc<Delivery>) -> BoxFuture<'static, HandlerResult>;
}

struct FnHandler<F>(F);

impl<F, Fut> MessageHandler for FnHandler<F>
where
    F: Fn(Arc<Delivery>) -> Fut + Send + Sync,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    fn handle(&self, message: Arc<Delivery>) -> BoxFuture<'static, HandlerResult> {
        Box::pin((self.0)(message))
    }
}

/// Wrap an async closure as a handler.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn MessageHandler>
where
    F: Fn(Arc<Delivery>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = HandlerResult> + Send + 'static,
{
    Arc::new(FnHandler(f))
}
