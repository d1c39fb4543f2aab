//! Burst rate limiter.

use super::{Next, Receiver};
use crate::envelope::Envelope;
use crate::error::ProcessError;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;

#[cfg(test)]
#[path = "rate_tests.rs"]
mod tests;

/// Pauses for `sleep` after every `limit` successful deliveries.
///
/// A poll cycle without a message ends the burst and resets the count.
#[derive(Debug)]
pub struct RateLimiterReceiver {
    limit: u64,
    sleep: Duration,
    burst: AtomicU64,
    throttled: AtomicU64,
}

impl RateLimiterReceiver {
    pub fn new(limit: u64, sleep: Duration) -> Self {
        Self {
            limit: limit.max(1),
            sleep,
            burst: AtomicU64::new(0),
            throttled: AtomicU64::new(0),
        }
    }

    /// Number of pauses taken so far
    pub fn throttled(&self) -> u64 {
        self.throttled.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Receiver for RateLimiterReceiver {
    async fn receive(&self, envelope: &mut Envelope, next: &dyn Next) -> Result<(), ProcessError> {
        next.receive(envelope).await?;

        let burst = self.burst.fetch_add(1, Ordering::SeqCst) + 1;
        if burst >= self.limit {
            debug!(
                limit = self.limit,
                sleep_ms = self.sleep.as_millis() as u64,
                "Rate limit reached; pausing"
            );
            tokio::time::sleep(self.sleep).await;
            self.burst.store(0, Ordering::SeqCst);
            self.throttled.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }

    async fn receive_timeout(&self, next: &dyn Next) -> Result<(), ProcessError> {
        self.burst.store(0, Ordering::SeqCst);
        next.receive_timeout().await
    }
}
