//! Resource limiters.
//!
//! Each limiter lets the current delivery finish, then asks the consumer to
//! stop once its threshold is reached. The stop takes effect before the next
//! poll.

use super::{Next, Receiver};
use crate::envelope::Envelope;
use crate::error::ProcessError;
use async_trait::async_trait;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

#[cfg(test)]
#[path = "limiter_tests.rs"]
mod tests;

// ============================================================================
// Message count
// ============================================================================

/// Stops after `limit` successfully handled deliveries
#[derive(Debug)]
pub struct MessageCountLimiterReceiver {
    limit: u64,
    handled: AtomicU64,
}

impl MessageCountLimiterReceiver {
    pub fn new(limit: u64) -> Self {
        Self {
            limit,
            handled: AtomicU64::new(0),
        }
    }

    pub fn handled(&self) -> u64 {
        self.handled.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Receiver for MessageCountLimiterReceiver {
    async fn receive(&self, envelope: &mut Envelope, next: &dyn Next) -> Result<(), ProcessError> {
        next.receive(envelope).await?;

        let handled = self.handled.fetch_add(1, Ordering::SeqCst) + 1;
        if handled >= self.limit {
            info!(handled, limit = self.limit, "Message limit reached; stopping consumer");
            next.stop();
        }
        Ok(())
    }

    async fn start(&self, next: &dyn Next) -> Result<(), ProcessError> {
        self.handled.store(0, Ordering::SeqCst);
        next.start().await
    }
}

// ============================================================================
// Memory
// ============================================================================

/// Source of the memory figure compared by [`MemoryLimiterReceiver`]
pub trait MemoryGauge: Send + Sync {
    /// Resident memory in bytes, when it can be determined
    fn resident_bytes(&self) -> Option<u64>;
}

/// Resident set size of the current process, read from `/proc/self/status`
#[derive(Debug, Default, Clone, Copy)]
pub struct ProcessMemory;

impl MemoryGauge for ProcessMemory {
    fn resident_bytes(&self) -> Option<u64> {
        let status = std::fs::read_to_string("/proc/self/status").ok()?;
        parse_vm_rss(&status)
    }
}

/// Extract `VmRSS` (reported in kB) from a proc status document
pub(crate) fn parse_vm_rss(status: &str) -> Option<u64> {
    let line = status.lines().find(|line| line.starts_with("VmRSS:"))?;
    let kilobytes: u64 = line
        .trim_start_matches("VmRSS:")
        .split_whitespace()
        .next()?
        .parse()
        .ok()?;
    Some(kilobytes * 1024)
}

/// Stops once resident memory exceeds `limit_bytes`
pub struct MemoryLimiterReceiver {
    limit_bytes: u64,
    gauge: Arc<dyn MemoryGauge>,
}

impl MemoryLimiterReceiver {
    pub fn new(limit_bytes: u64) -> Self {
        Self::with_gauge(limit_bytes, Arc::new(ProcessMemory))
    }

    pub fn with_gauge(limit_bytes: u64, gauge: Arc<dyn MemoryGauge>) -> Self {
        Self { limit_bytes, gauge }
    }

    fn check(&self, next: &dyn Next) {
        match self.gauge.resident_bytes() {
            Some(used) if used > self.limit_bytes => {
                info!(
                    used,
                    limit = self.limit_bytes,
                    "Memory limit exceeded; stopping consumer"
                );
                next.stop();
            }
            Some(_) => {}
            None => debug!("Resident memory unavailable; memory limit not enforced"),
        }
    }
}

#[async_trait]
impl Receiver for MemoryLimiterReceiver {
    async fn receive(&self, envelope: &mut Envelope, next: &dyn Next) -> Result<(), ProcessError> {
        next.receive(envelope).await?;
        self.check(next);
        Ok(())
    }

    async fn receive_timeout(&self, next: &dyn Next) -> Result<(), ProcessError> {
        next.receive_timeout().await?;
        self.check(next);
        Ok(())
    }
}

// ============================================================================
// Time
// ============================================================================

/// Stops once the consumer has been running for `limit`
#[derive(Debug)]
pub struct TimeLimiterReceiver {
    limit: Duration,
    started: Mutex<Instant>,
}

impl TimeLimiterReceiver {
    pub fn new(limit: Duration) -> Self {
        Self {
            limit,
            started: Mutex::new(Instant::now()),
        }
    }

    fn check(&self, next: &dyn Next) {
        let started = *self.started.lock().unwrap_or_else(PoisonError::into_inner);
        let elapsed = started.elapsed();
        if elapsed >= self.limit {
            info!(
                elapsed_secs = elapsed.as_secs(),
                limit_secs = self.limit.as_secs(),
                "Time limit reached; stopping consumer"
            );
            next.stop();
        }
    }
}

#[async_trait]
impl Receiver for TimeLimiterReceiver {
    async fn receive(&self, envelope: &mut Envelope, next: &dyn Next) -> Result<(), ProcessError> {
        next.receive(envelope).await?;
        self.check(next);
        Ok(())
    }

    async fn receive_timeout(&self, next: &dyn Next) -> Result<(), ProcessError> {
        next.receive_timeout().await?;
        self.check(next);
        Ok(())
    }

    async fn start(&self, next: &dyn Next) -> Result<(), ProcessError> {
        *self.started.lock().unwrap_or_else(PoisonError::into_inner) = Instant::now();
        next.start().await
    }
}
