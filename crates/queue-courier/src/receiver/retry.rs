//! # Retry Receiver
//!
//! Re-sends failed deliveries with exponential backoff until the message
//! exhausts its tries.
//!
//! Attempts are counted from 1. With `max_tries = k` a message that always
//! fails is delivered `k + 1` times: attempts `1..=k` are retried and the
//! failure of attempt `k + 1` propagates. A per-message
//! [`Message::max_tries`](crate::message::Message::max_tries) overrides the
//! receiver default; `0` disables retries for that message.

use super::{Next, Receiver};
use crate::envelope::Envelope;
use crate::error::ProcessError;
use async_trait::async_trait;
use rand::Rng;
use std::time::Duration;
use tracing::warn;

#[cfg(test)]
#[path = "retry_tests.rs"]
mod tests;

/// Retry limits and backoff configuration
///
/// # Examples
///
/// ```rust
/// use queue_courier::receiver::RetryPolicy;
/// use std::time::Duration;
///
/// // Three retries, 10s between each
/// let policy = RetryPolicy::fixed(3, Duration::from_secs(10));
/// assert_eq!(policy.delay_seconds(1), 10);
///
/// // Exponential: 1s, 2s, 4s, ... capped at 60s
/// let policy = RetryPolicy::new(5, Duration::from_secs(1), Duration::from_secs(60), 2.0)
///     .without_jitter();
/// assert_eq!(policy.delay_seconds(3), 4);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Number of retries after the first attempt
    pub max_tries: u32,

    /// Delay before the first retry
    pub initial_delay: Duration,

    /// Maximum delay between retries
    pub max_delay: Duration,

    /// Exponential backoff multiplier
    pub backoff_multiplier: f64,

    /// Whether to add jitter to delays
    pub use_jitter: bool,

    /// Jitter range as a fraction of the delay (0.25 = ±25%)
    pub jitter_percent: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fixed(3, Duration::ZERO)
    }
}

impl RetryPolicy {
    /// Exponential backoff policy with ±25% jitter
    pub fn new(
        max_tries: u32,
        initial_delay: Duration,
        max_delay: Duration,
        backoff_multiplier: f64,
    ) -> Self {
        Self {
            max_tries,
            initial_delay,
            max_delay,
            backoff_multiplier,
            use_jitter: true,
            jitter_percent: 0.25,
        }
    }

    /// Constant delay between retries, no jitter
    pub fn fixed(max_tries: u32, delay: Duration) -> Self {
        Self {
            max_tries,
            initial_delay: delay,
            max_delay: delay,
            backoff_multiplier: 1.0,
            use_jitter: false,
            jitter_percent: 0.0,
        }
    }

    pub fn without_jitter(mut self) -> Self {
        self.use_jitter = false;
        self
    }

    /// Set custom jitter percentage (0.0 to 1.0)
    pub fn with_jitter_percent(mut self, percent: f64) -> Self {
        self.jitter_percent = percent.clamp(0.0, 1.0);
        self
    }

    /// Delay before re-delivering a message that failed on `attempts` (1-based).
    ///
    /// Formula: `initial * multiplier^(attempts - 1)`, capped at `max_delay`.
    pub fn calculate_delay(&self, attempts: u32) -> Duration {
        let exponent = attempts.saturating_sub(1).min(i32::MAX as u32) as i32;
        let base_delay_secs = self.initial_delay.as_secs_f64() * self.backoff_multiplier.powi(exponent);
        let capped_delay_secs = base_delay_secs.min(self.max_delay.as_secs_f64());

        let final_delay_secs = if self.use_jitter {
            Self::add_jitter(capped_delay_secs, self.jitter_percent)
        } else {
            capped_delay_secs
        };

        Duration::try_from_secs_f64(final_delay_secs.max(0.0)).unwrap_or(self.max_delay)
    }

    /// Delay in whole seconds, as drivers schedule it
    pub fn delay_seconds(&self, attempts: u32) -> u64 {
        self.calculate_delay(attempts).as_secs_f64().round() as u64
    }

    /// Check if a delivery that failed on `attempts` may be retried
    pub fn should_retry(&self, attempts: u32, max_tries: Option<u32>) -> bool {
        attempts <= max_tries.unwrap_or(self.max_tries)
    }

    fn add_jitter(delay_secs: f64, jitter_percent: f64) -> f64 {
        let jitter_range = delay_secs * jitter_percent;
        if jitter_range <= 0.0 {
            return delay_secs;
        }

        let mut rng = rand::thread_rng();
        let jitter = rng.gen_range(-jitter_range..=jitter_range);
        (delay_secs + jitter).max(0.0)
    }
}

/// Retries failed deliveries through [`Envelope::retry`]
pub struct RetryReceiver {
    policy: RetryPolicy,
}

impl RetryReceiver {
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }
}

#[async_trait]
impl Receiver for RetryReceiver {
    async fn receive(&self, envelope: &mut Envelope, next: &dyn Next) -> Result<(), ProcessError> {
        let err = match next.receive(envelope).await {
            Ok(()) => return Ok(()),
            Err(err) if err.is_fatal() => return Err(err),
            Err(err) => err,
        };

        let message = envelope.message();
        let attempts = message.attempts();
        if !self.policy.should_retry(attempts, message.max_tries()) {
            return Err(err);
        }

        let delay = self.policy.delay_seconds(attempts);
        warn!(
            job = %message.message().display_name(),
            queue = %message.queue(),
            attempts,
            delay,
            error = %err,
            "Delivery failed; retrying"
        );

        envelope.retry(delay).await?;
        Ok(())
    }
}
