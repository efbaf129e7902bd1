//! Handler middleware.
//!
//! Middleware wraps a handler onion-style: the first middleware in the list is the
//! outermost layer and sees the message first and the result last.

use std::sync::Arc;
use std::time::Instant;

use futures::future::BoxFuture;
use tracing::{debug, info_span, warn, Instrument};

use super::handler::{Delivery, HandlerResult, MessageHandler};

/// The rest of the pipeline below a middleware.
#[derive(Clone)]
pub struct Next {
    inner: Arc<dyn MessageHandler>,
}

impl Next {
    pub fn run(self, message: Arc<Delivery>) -> BoxFuture<'static, HandlerResult> {
        self.inner.handle(message)
    }
}

/// A layer around message handling.
pub trait Middleware: Send + Sync {
    fn call(&self, message: Arc<Delivery>, next: Next) -> BoxFuture<'static, HandlerResult>;
}

struct Layer {
    middleware: Arc<dyn Middleware>,
    next: Arc<dyn MessageHandler>,
}

impl MessageHandler for Layer {
    fn handle(&self, message: Arc<Delivery>) -> BoxFuture<'static, HandlerResult> {
        self.middleware.call(
            message,
            Next {
                inner: self.next.clone(),
            },
        )
    }
}

/// Compose middleware around a handler into a single pipeline.
pub fn compose(
    middleware: &[Arc<dyn Middleware>],
    handler: Arc<dyn MessageHandler>,
) -> Arc<dyn MessageHandler> {
    middleware.iter().rev().fold(handler, |next, layer| {
        Arc::new(Layer {
            middleware: layer.clone(),
            next,
        })
    })
}

/// Runs each handler call inside a span and logs its outcome and duration.
#[derive(Debug, Clone, Copy, Default)]
pub struct LoggingMiddleware;

impl Middleware for LoggingMiddleware {
    fn call(&self, message: Arc<Delivery>, next: Next) -> BoxFuture<'static, HandlerResult> {
        let span = info_span!(
            "handle_message",
            subject = %message.subject,
            consumer = %message.consumer,
            event_id = message.event_id().unwrap_or(""),
            deliveries = message.deliveries,
        );
        Box::pin(
            async move {
                let started = Instant::now();
                let result = next.run(message).await;
                let elapsed_ms = started.elapsed().as_millis() as u64;
                match &result {
                    Ok(()) => debug!(elapsed_ms, "Handler succeeded"),
                    Err(e) => warn!(elapsed_ms, error = %e, "Handler failed"),
                }
                result
            }
            .instrument(span),
        )
    }
}
