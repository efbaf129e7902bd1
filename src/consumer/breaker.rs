//! Circuit breakers around handler invocation.

use std::sync::{Mutex, MutexGuard};
use std::time::{Duration, Instant};

use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerState {
    Closed,
    Open,
    /// Cool-down elapsed; one probe call is let through.
    HalfOpen,
}

/// Gate consulted before each handler call.
pub trait CircuitBreaker: Send + Sync {
    /// Whether a call may proceed now.
    fn try_acquire(&self) -> bool;

    fn on_success(&self);

    fn on_failure(&self);

    fn state(&self) -> BreakerState;
}

struct BreakerInner {
    state: BreakerState,
    consecutive_failures: u32,
    opened_at: Option<Instant>,
    probe_in_flight: bool,
}

/// Opens after `threshold` consecutive failures and stays open for `cool_down`.
pub struct ConsecutiveFailureBreaker {
    threshold: u32,
    cool_down: Duration,
    inner: Mutex<BreakerInner>,
}

impl ConsecutiveFailureBreaker {
    pub fn new(threshold: u32, cool_down: Duration) -> Self {
        Self {
            threshold: threshold.max(1),
            cool_down,
            inner: Mutex::new(BreakerInner {
                state: BreakerState::Closed,
                consecutive_failures: 0,
                opened_at: None,
                probe_in_flight: false,
            }),
        }
    }

    fn inner(&self) -> MutexGuard<'_, BreakerInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl CircuitBreaker for ConsecutiveFailureBreaker {
    fn try_acquire(&self) -> bool {
        let mut inner = self.inner();
        match inner.state {
            BreakerState::Closed => true,
            BreakerState::Open => {
                let cooled = inner
                    .opened_at
                    .is_some_and(|at| at.elapsed() >= self.cool_down);
                if cooled {
                    inner.state = BreakerState::HalfOpen;
                    inner.probe_in_flight = true;
                }
                cooled
            }
            BreakerState::HalfOpen => {
                if inner.probe_in_flight {
                    false
                } else {
                    inner.probe_in_flight = true;
                    true
                }
            }
        }
    }

    fn on_success(&self) {
        let mut inner = self.inner();
        if inner.state != BreakerState::Closed {
            info!("Circuit breaker closed");
        }
        inner.state = BreakerState::Closed;
        inner.consecutive_failures = 0;
        inner.opened_at = None;
        inner.probe_in_flight = false;
    }

    fn on_failure(&self) {
        let mut inner = self.inner();
        inner.probe_in_flight = false;
        inner.consecutive_failures = inner.consecutive_failures.saturating_add(1);
        let trip = inner.state == BreakerState::HalfOpen
            || (inner.state == BreakerState::Closed && inner.consecutive_failures >= self.threshold);
        if trip {
            warn!(
                failures = inner.consecutive_failures,
                cool_down_ms = self.cool_down.as_millis() as u64,
                "Circuit breaker opened"
            );
            inner.state = BreakerState::Open;
            inner.opened_at = Some(Instant::now());
        }
    }

    fn state(&self) -> BreakerState {
        self.inner().state
    }
}
