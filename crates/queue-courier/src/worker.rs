//! Worker loop driving one consumer.

use crate::consumer::{QueueConsumer, StopHandle};
use crate::error::ProcessError;
use serde::Deserialize;
use std::time::Duration;
use tracing::{error, info, warn};

#[cfg(test)]
#[path = "worker_tests.rs"]
mod tests;

/// Loop options
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct WorkerOptions {
    /// Longest a single poll waits for a message
    #[serde(with = "duration_secs")]
    pub duration: Duration,

    /// Leave the loop on the first non-fatal error instead of logging it
    pub stop_on_error: bool,
}

impl Default for WorkerOptions {
    fn default() -> Self {
        Self {
            duration: Duration::from_secs(3),
            stop_on_error: true,
        }
    }
}

/// Duration of `seconds`, negative values clamped to zero; `None` when the
/// value is infinite or too large for a [`Duration`]
pub(crate) fn seconds(seconds: f64) -> Option<Duration> {
    Duration::try_from_secs_f64(seconds.max(0.0)).ok()
}

mod duration_secs {
    use serde::de::Error;
    use serde::{Deserialize, Deserializer};
    use std::time::Duration;

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let value = f64::deserialize(deserializer)?;
        super::seconds(value)
            .ok_or_else(|| D::Error::custom(format!("{} is not a valid number of seconds", value)))
    }
}

/// Runs `consume` on a consumer until it is stopped
pub struct Worker {
    consumer: QueueConsumer,
    options: WorkerOptions,
}

impl Worker {
    pub fn new(consumer: QueueConsumer, options: WorkerOptions) -> Self {
        Self { consumer, options }
    }

    pub fn consumer(&self) -> &QueueConsumer {
        &self.consumer
    }

    /// Flag stopping the loop before its next poll
    pub fn stop_handle(&self) -> StopHandle {
        self.consumer.stop_handle()
    }

    /// Run until stopped.
    ///
    /// Calls `start` before the first poll, then `receive_stop` and
    /// `terminate` when the loop ends, also when it ends with an error. Fatal
    /// errors always end the loop; other errors end it only with
    /// `stop_on_error`.
    pub async fn run(&self) -> Result<(), ProcessError> {
        info!(
            connection = %self.consumer.connection().name(),
            queue = %self.consumer.queue(),
            "Worker starting"
        );

        let result = match self.consumer.start().await {
            Ok(()) => self.run_loop().await,
            Err(err) => Err(err),
        };

        let shutdown = self.shutdown().await;

        match (&result, shutdown) {
            (_, Ok(())) => {}
            (Ok(()), Err(err)) => return Err(err),
            (Err(_), Err(err)) => warn!(error = %err, "Shutdown failed after worker error"),
        }

        if let Err(err) = &result {
            error!(queue = %self.consumer.queue(), error = %err, "Worker stopped on error");
        } else {
            info!(queue = %self.consumer.queue(), "Worker stopped");
        }
        result
    }

    async fn run_loop(&self) -> Result<(), ProcessError> {
        while !self.consumer.is_stopped() {
            match self.consumer.consume(self.options.duration).await {
                Ok(()) => {}
                Err(err) if err.is_fatal() || self.options.stop_on_error => return Err(err),
                Err(err) => warn!(
                    queue = %self.consumer.queue(),
                    error = %err,
                    "Delivery failed; continuing"
                ),
            }
        }
        Ok(())
    }

    async fn shutdown(&self) -> Result<(), ProcessError> {
        let stopped = self.consumer.receive_stop().await;
        let terminated = self.consumer.terminate().await;
        stopped.and(terminated)
    }
}
