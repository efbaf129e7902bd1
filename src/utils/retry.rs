//! Backoff builders.
//!
//! Uses `backon` for exponential backoff with jitter.

use std::time::Duration;

use backon::{BackoffBuilder, ExponentialBuilder};

/// Upper bound between failed pulls.
pub const PULL_MAX_DELAY: Duration = Duration::from_secs(5);

/// Backoff between failed pulls from a durable consumer.
///
/// - Min delay: 50ms
/// - Max delay: 5s
/// - Max attempts: 10, then [`PULL_MAX_DELAY`] forever (see [`PullBackoff`])
/// - Jitter enabled
pub fn pull_backoff() -> ExponentialBuilder {
    ExponentialBuilder::default()
        .with_min_delay(Duration::from_millis(50))
        .with_max_delay(PULL_MAX_DELAY)
        .with_max_times(10)
        .with_jitter()
}

/// Pull retry delays that reset after a successful pull.
pub struct PullBackoff {
    builder: ExponentialBuilder,
    iter: <ExponentialBuilder as BackoffBuilder>::Backoff,
}

impl PullBackoff {
    pub fn new() -> Self {
        let builder = pull_backoff();
        Self {
            iter: builder.build(),
            builder,
        }
    }

    pub fn next_delay(&mut self) -> Duration {
        self.iter.next().unwrap_or(PULL_MAX_DELAY)
    }

    pub fn reset(&mut self) {
        self.iter = self.builder.build();
    }
}

impl Default for PullBackoff {
    fn default() -> Self {
        Self::new()
    }
}
