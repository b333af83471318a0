//! Worker retry policy: exponential backoff with jitter.
//!
//! Classification is the transport's job (`TransportError::retryable`); this
//! module decides when to stop and how long to sleep in between.

use rand::Rng;
use std::time::Duration;

/// Decision returned by the retry policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    NoRetry,
    RetryAfter(Duration),
}

/// Exponential backoff with caps and ±20 % jitter.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    /// Maximum number of attempts (including the first).
    pub max_attempts: u32,
    /// Base delay for backoff.
    pub base_delay: Duration,
    /// Upper bound on backoff delay.
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(30),
        }
    }
}

impl RetryPolicy {
    /// Compute the backoff for a given attempt. `attempt` is 1-based;
    /// `retryable` comes from the transport error classification.
    pub fn decide(&self, attempt: u32, retryable: bool) -> RetryDecision {
        if !retryable || attempt >= self.max_attempts {
            return RetryDecision::NoRetry;
        }
        let exp = 1u32 << attempt.saturating_sub(1).min(8);
        let raw = self.base_delay.saturating_mul(exp).min(self.max_delay);
        RetryDecision::RetryAfter(jitter(raw))
    }
}

/// Spread a delay by ±20 % so retries from parallel workers don't align.
fn jitter(d: Duration) -> Duration {
    let factor = rand::thread_rng().gen_range(0.8..=1.2);
    d.mul_f64(factor)
}
