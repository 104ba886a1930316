//! Backoff between extraction attempts
//!
//! The cascade moves to a new strategy after every failure rather than
//! retrying the same one, but still waits between attempts so a flaky upstream
//! is not hammered. Delays grow exponentially up to `max_delay`, with optional
//! jitter to prevent thundering herd when many jobs fail at once.

use crate::config::RetryConfig;
use crate::error::ExtractionError;
use rand::Rng;
use std::time::Duration;

/// Trait for errors that can be classified as retryable or not
///
/// A retryable failure lets the cascade move on to the next strategy. A
/// non-retryable one stops the cascade immediately.
pub trait IsRetryable {
    /// Returns true if another strategy might succeed where this attempt failed
    fn is_retryable(&self) -> bool;
}

impl IsRetryable for ExtractionError {
    fn is_retryable(&self) -> bool {
        match self {
            // Credentials, egress route and headers all change between strategies
            ExtractionError::ToolFailed { .. } => true,
            ExtractionError::NoOutput(_) => true,
            ExtractionError::AttemptTimedOut(_) => true,
            // The binary itself is missing or not executable; no strategy can fix that
            ExtractionError::Launch { .. } => false,
            ExtractionError::Cancelled => false,
        }
    }
}

/// Exponential backoff state for one cascade run
#[derive(Debug, Clone)]
pub struct Backoff {
    next: Duration,
    max: Duration,
    multiplier: f64,
    jitter: bool,
}

impl Backoff {
    /// Start a new backoff sequence
    pub fn new(config: &RetryConfig) -> Self {
        Self {
            next: config.initial_delay.min(config.max_delay),
            max: config.max_delay,
            multiplier: config.backoff_multiplier,
            jitter: config.jitter,
        }
    }

    /// Delay to wait now; advances the sequence
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        let grown = Duration::from_secs_f64(delay.as_secs_f64() * self.multiplier.max(1.0));
        self.next = grown.min(self.max);

        if self.jitter {
            add_jitter(delay)
        } else {
            delay
        }
    }
}

/// Largest total delay `gaps` consecutive backoff waits can add up to
///
/// Jitter can double a delay, so it is accounted for at its maximum.
pub fn worst_case_delay(config: &RetryConfig, gaps: usize) -> Duration {
    let mut backoff = Backoff::new(&RetryConfig {
        jitter: false,
        ..config.clone()
    });
    let total: Duration = (0..gaps).map(|_| backoff.next_delay()).sum();
    if config.jitter { total * 2 } else { total }
}

/// Add random jitter to a delay to prevent thundering herd
///
/// Jitter is uniformly distributed between 0% and 100% of the delay.
/// This means the actual delay will be between `delay` and `2 * delay`.
fn add_jitter(delay: Duration) -> Duration {
    let mut rng = rand::thread_rng();
    let jitter_factor: f64 = rng.gen_range(0.0..=1.0);
    let jittered_secs = delay.as_secs_f64() * (1.0 + jitter_factor);
    Duration::from_secs_f64(jittered_secs)
}
