//! Test utilities and mock handlers.
//!
//! Handlers here record what they saw so tests can assert on delivery counts
//! without a real subscriber.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;

use crate::consumer::{Delivery, HandlerResult, MessageHandler};

/// Succeeds and records every delivery.
#[derive(Default)]
pub struct CountingHandler {
    calls: AtomicUsize,
    seen: Mutex<Vec<Arc<Delivery>>>,
}

impl CountingHandler {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }

    pub fn seen(&self) -> Vec<Arc<Delivery>> {
        self.seen.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl MessageHandler for CountingHandler {
    fn handle(&self, message: Arc<Delivery>) -> BoxFuture<'static, HandlerResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        self.seen
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(message);
        Box::pin(async { Ok(()) })
    }
}

/// Fails the first `failures` calls, then succeeds.
///
/// `usize::MAX` fails forever.
pub struct FailingHandler {
    failures: usize,
    message: String,
    calls: AtomicUsize,
}

impl FailingHandler {
    pub fn always(message: impl Into<String>) -> Arc<Self> {
        Self::times(usize::MAX, message)
    }

    pub fn times(failures: usize, message: impl Into<String>) -> Arc<Self> {
        Arc::new(Self {
            failures,
            message: message.into(),
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl MessageHandler for FailingHandler {
    fn handle(&self, _message: Arc<Delivery>) -> BoxFuture<'static, HandlerResult> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        let result: HandlerResult = if call < self.failures {
            Err(self.message.clone().into())
        } else {
            Ok(())
        };
        Box::pin(async move { result })
    }
}

/// Sleeps before succeeding.
pub struct SlowHandler {
    delay: Duration,
    calls: AtomicUsize,
}

impl SlowHandler {
    pub fn new(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl MessageHandler for SlowHandler {
    fn handle(&self, _message: Arc<Delivery>) -> BoxFuture<'static, HandlerResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let delay = self.delay;
        Box::pin(async move {
            tokio::time::sleep(delay).await;
            Ok(())
        })
    }
}

/// Poll `condition` every 10ms until it holds or `timeout` elapses.
pub async fn wait_until<F>(timeout: Duration, mut condition: F) -> bool
where
    F: FnMut() -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if condition() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}
