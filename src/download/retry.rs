//! Backoff between download attempts.
//!
//! Every failed attempt is retried until the attempt budget is spent; the
//! backoff only decides how long to wait in between:
//!
//! ```text
//! delay = min(base_delay * 2^(attempt - 1), 32s) + jitter(0..=500ms)
//! ```
//!
//! A zero base delay disables waiting entirely, jitter included.

use std::time::Duration;

use rand::Rng;

/// Maximum delay cap (32 seconds).
const MAX_DELAY: Duration = Duration::from_secs(32);

/// Multiplier applied each attempt.
const BACKOFF_MULTIPLIER: f64 = 2.0;

/// Maximum jitter added to delays (500ms).
const MAX_JITTER: Duration = Duration::from_millis(500);

/// Exponential backoff with jitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryBackoff {
    base_delay: Duration,
}

impl RetryBackoff {
    /// Creates a backoff starting at `base_delay`.
    #[must_use]
    pub fn new(base_delay: Duration) -> Self {
        Self { base_delay }
    }

    /// Base delay for the first retry.
    #[must_use]
    pub fn base_delay(&self) -> Duration {
        self.base_delay
    }

    /// Delay to wait after failed attempt number `attempt` (1-indexed).
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        if self.base_delay.is_zero() {
            return Duration::ZERO;
        }
        self.backoff(attempt) + jitter()
    }

    /// Delay without jitter.
    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation, clippy::cast_sign_loss)]
    fn backoff(&self, attempt: u32) -> Duration {
        let base_ms = self.base_delay.as_millis() as f64;
        let exponent = f64::from(attempt.max(1) - 1);
        let delay_ms = (base_ms * BACKOFF_MULTIPLIER.powf(exponent))
            .min(MAX_DELAY.as_millis() as f64);
        Duration::from_millis(delay_ms as u64)
    }
}

#[allow(clippy::cast_possible_truncation)]
fn jitter() -> Duration {
    let jitter_ms = rand::thread_rng().gen_range(0..=MAX_JITTER.as_millis() as u64);
    Duration::from_millis(jitter_ms)
}
