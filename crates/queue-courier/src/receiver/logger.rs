//! Receiver logging each delivery inside a tracing span.

use super::{Next, Receiver};
use crate::envelope::Envelope;
use crate::error::ProcessError;
use async_trait::async_trait;
use tracing::{debug, info, info_span, warn, Instrument};

#[cfg(test)]
#[path = "logger_tests.rs"]
mod tests;

/// Logs receipt, success and failure of every delivery; forwards unchanged
#[derive(Debug, Default)]
pub struct MessageLoggerReceiver;

impl MessageLoggerReceiver {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Receiver for MessageLoggerReceiver {
    async fn receive(&self, envelope: &mut Envelope, next: &dyn Next) -> Result<(), ProcessError> {
        let message = envelope.message();
        let span = info_span!(
            "delivery",
            id = %message.message().id,
            job = %message.message().display_name(),
            queue = %message.queue(),
            attempts = message.attempts(),
        );

        async move {
            info!("Received message");
            let result = next.receive(envelope).await;
            match &result {
                Ok(()) => info!(state = ?envelope.state(), "Message handled"),
                Err(err) => warn!(error = %err, state = ?envelope.state(), "Message failed"),
            }
            result
        }
        .instrument(span)
        .await
    }

    async fn receive_timeout(&self, next: &dyn Next) -> Result<(), ProcessError> {
        debug!("No message received");
        next.receive_timeout().await
    }

    async fn receive_stop(&self, next: &dyn Next) -> Result<(), ProcessError> {
        info!("Consumer stopping");
        next.receive_stop().await
    }
}
