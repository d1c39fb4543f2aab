//! Receiver that keeps the consume loop alive across ordinary failures.

use super::{Next, Receiver};
use crate::envelope::Envelope;
use crate::error::ProcessError;
use async_trait::async_trait;
use tracing::warn;

#[cfg(test)]
#[path = "no_failure_tests.rs"]
mod tests;

/// Swallows every error except [`ProcessError::Fatal`].
///
/// Install it outside the retry and store receivers; nested inside them it
/// hides failures from their policies.
#[derive(Debug, Default)]
pub struct NoFailureReceiver;

impl NoFailureReceiver {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Receiver for NoFailureReceiver {
    async fn receive(&self, envelope: &mut Envelope, next: &dyn Next) -> Result<(), ProcessError> {
        match next.receive(envelope).await {
            Err(err) if !err.is_fatal() => {
                warn!(
                    job = %envelope.message().message().display_name(),
                    queue = %envelope.message().queue(),
                    error = %err,
                    "Discarding delivery failure"
                );
                Ok(())
            }
            result => result,
        }
    }
}
