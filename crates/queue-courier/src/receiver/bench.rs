//! Handling time aggregation.

use super::{Next, Receiver};
use crate::envelope::Envelope;
use crate::error::ProcessError;
use async_trait::async_trait;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tracing::info;

#[cfg(test)]
#[path = "bench_tests.rs"]
mod tests;

/// Aggregated handling times
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BenchReport {
    pub count: u64,
    pub min: Duration,
    pub max: Duration,
    pub total: Duration,
}

impl BenchReport {
    pub fn average(&self) -> Duration {
        match u32::try_from(self.count) {
            Ok(0) => Duration::ZERO,
            Ok(count) => self.total / count,
            Err(_) => Duration::from_secs_f64(self.total.as_secs_f64() / self.count as f64),
        }
    }

    fn record(&mut self, elapsed: Duration) {
        self.min = if self.count == 0 { elapsed } else { self.min.min(elapsed) };
        self.max = self.max.max(elapsed);
        self.total += elapsed;
        self.count += 1;
    }
}

/// Measures every delivery and logs a summary when the consumer stops
#[derive(Debug, Default)]
pub struct BenchReceiver {
    report: Mutex<BenchReport>,
}

impl BenchReceiver {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn report(&self) -> BenchReport {
        *self.report.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn log_summary(&self) {
        let report = self.report();
        if report.count == 0 {
            return;
        }
        info!(
            count = report.count,
            min_ms = report.min.as_millis() as u64,
            max_ms = report.max.as_millis() as u64,
            avg_ms = report.average().as_millis() as u64,
            total_ms = report.total.as_millis() as u64,
            "Benchmark summary"
        );
    }
}

#[async_trait]
impl Receiver for BenchReceiver {
    async fn receive(&self, envelope: &mut Envelope, next: &dyn Next) -> Result<(), ProcessError> {
        let started = Instant::now();
        let result = next.receive(envelope).await;
        self.report
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .record(started.elapsed());
        result
    }

    async fn receive_stop(&self, next: &dyn Next) -> Result<(), ProcessError> {
        self.log_summary();
        next.receive_stop().await
    }

    async fn terminate(&self, next: &dyn Next) -> Result<(), ProcessError> {
        self.log_summary();
        next.terminate().await
    }
}
