//! Retry ceiling and exponential backoff for offline operations.

use chrono::{DateTime, Utc};
use std::time::Duration;

use fieldkeep_common::Error;

/// Configuration for retry behavior.
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// Failed attempts after which an operation is given up on.
    pub max_retries: u32,
    /// Initial delay between retries.
    pub initial_delay: Duration,
    /// Maximum delay (cap for exponential growth).
    pub max_delay: Duration,
    /// Multiplier for exponential backoff.
    pub backoff_multiplier: f64,
    /// Whether to add jitter to delays.
    pub jitter: bool,
}

impl RetryConfig {
    /// Create a new retry configuration.
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            initial_delay: Duration::from_secs(10),
            max_delay: Duration::from_secs(300),
            backoff_multiplier: 2.0,
            jitter: true,
        }
    }

    /// Set initial delay.
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    /// Set maximum delay.
    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    /// Set backoff multiplier.
    pub fn with_backoff_multiplier(mut self, multiplier: f64) -> Self {
        self.backoff_multiplier = multiplier;
        self
    }

    /// Enable or disable jitter.
    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Calculate delay for a given attempt number (0-based).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(i32::MAX as u32) as i32;
        let base_delay =
            self.initial_delay.as_millis() as f64 * self.backoff_multiplier.powi(exponent);

        let capped_delay = base_delay.min(self.max_delay.as_millis() as f64);

        let final_delay = if self.jitter {
            // +/- 25%
            let jitter_factor = 0.75 + (rand::random::<f64>() * 0.5);
            capped_delay * jitter_factor
        } else {
            capped_delay
        };

        Duration::from_millis(final_delay.max(0.0) as u64)
    }

    /// Earliest time an operation may be retried after its `failures`-th failure.
    pub fn next_attempt_at(&self, last_attempt: DateTime<Utc>, failures: u32) -> DateTime<Utc> {
        let delay = self.delay_for_attempt(failures.saturating_sub(1));
        let delay = chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX);
        last_attempt
            .checked_add_signed(delay)
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    /// Whether `failures` has reached the retry ceiling.
    pub fn is_exhausted(&self, failures: u32) -> bool {
        failures >= self.max_retries
    }

    /// Whether a failure is worth another attempt later.
    pub fn is_retryable(&self, err: &Error) -> bool {
        err.is_recoverable()
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3)
    }
}
