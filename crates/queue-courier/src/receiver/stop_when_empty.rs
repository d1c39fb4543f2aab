//! Receiver stopping the consumer once its queue runs dry.

use super::{Next, Receiver};
use crate::error::ProcessError;
use async_trait::async_trait;
use tracing::info;

#[cfg(test)]
#[path = "stop_when_empty_tests.rs"]
mod tests;

/// Stops the consumer on the first poll cycle that yields nothing
#[derive(Debug, Default)]
pub struct StopWhenEmptyReceiver;

impl StopWhenEmptyReceiver {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Receiver for StopWhenEmptyReceiver {
    async fn receive_timeout(&self, next: &dyn Next) -> Result<(), ProcessError> {
        info!("Queue is empty; stopping consumer");
        next.stop();
        next.receive_timeout().await
    }
}
