//! Terminal receiver invoking application handlers.

use super::{Next, Receiver};
use crate::envelope::Envelope;
use crate::error::ProcessError;
use crate::handler::HandlerRegistry;
use async_trait::async_trait;
use tracing::warn;

#[cfg(test)]
#[path = "processor_tests.rs"]
mod tests;

/// Resolves the handler of a delivery, runs it and finalizes the envelope.
///
/// On success the envelope is acknowledged unless the handler finalized it.
/// On failure it is rejected without requeue and the error is returned.
/// Never forwards to `next`.
pub struct ProcessorReceiver {
    registry: HandlerRegistry,
}

impl ProcessorReceiver {
    pub fn new(registry: HandlerRegistry) -> Self {
        Self { registry }
    }

    /// Reject the delivery and return `err`; a failing reject is only logged
    async fn fail(envelope: &mut Envelope, err: ProcessError) -> Result<(), ProcessError> {
        if let Err(reject_err) = envelope.reject(false).await {
            warn!(
                queue = %envelope.message().queue(),
                error = %err,
                reject_error = %reject_err,
                "Failed to reject delivery after processing failure"
            );
        }
        Err(err)
    }
}

#[async_trait]
impl Receiver for ProcessorReceiver {
    async fn receive(&self, envelope: &mut Envelope, _next: &dyn Next) -> Result<(), ProcessError> {
        if let Some(error) = envelope.message().error() {
            let err = anyhow::anyhow!("Message could not be decoded: {}", error);
            return Self::fail(envelope, ProcessError::Handler(err)).await;
        }

        let Some(handler) = self.registry.resolve(envelope.message()) else {
            let err = ProcessError::Unresolved {
                job: envelope.message().message().display_name().to_string(),
                queue: envelope.message().queue().to_string(),
            };
            return Self::fail(envelope, err).await;
        };

        match handler.handle(envelope).await {
            Ok(()) => {
                envelope.acknowledge().await?;
                Ok(())
            }
            Err(err) => {
                // Handlers signal fatal faults by returning a ProcessError.
                let err = match err.downcast::<ProcessError>() {
                    Ok(process) => process,
                    Err(err) => ProcessError::Handler(err),
                };
                Self::fail(envelope, err).await
            }
        }
    }

    async fn receive_timeout(&self, _next: &dyn Next) -> Result<(), ProcessError> {
        Ok(())
    }

    async fn receive_stop(&self, _next: &dyn Next) -> Result<(), ProcessError> {
        Ok(())
    }

    async fn start(&self, _next: &dyn Next) -> Result<(), ProcessError> {
        Ok(())
    }

    async fn terminate(&self, _next: &dyn Next) -> Result<(), ProcessError> {
        Ok(())
    }
}
