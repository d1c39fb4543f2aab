//! Store-on-failure receiver.

use super::{Next, Receiver};
use crate::envelope::Envelope;
use crate::error::ProcessError;
use crate::failer::{FailedJob, FailedJobStore};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::error;

#[cfg(test)]
#[path = "store_tests.rs"]
mod tests;

/// Captures failed deliveries in a [`FailedJobStore`] and re-raises the error.
///
/// Messages flagged `no_store` (including error messages) are never captured.
/// The snapshot has its attempt counter reset. A store failure is logged and
/// the original error is returned.
pub struct StoreFailedReceiver {
    store: Arc<dyn FailedJobStore>,
}

impl StoreFailedReceiver {
    pub fn new(store: Arc<dyn FailedJobStore>) -> Self {
        Self { store }
    }
}

#[async_trait]
impl Receiver for StoreFailedReceiver {
    async fn receive(&self, envelope: &mut Envelope, next: &dyn Next) -> Result<(), ProcessError> {
        let err = match next.receive(envelope).await {
            Ok(()) => return Ok(()),
            Err(err) => err,
        };

        let message = envelope.message();
        if message.no_store() {
            return Err(err);
        }

        let job = FailedJob::create(&message.reset_attempts(), &err);
        let id = job.id.clone();
        match self.store.store(job).await {
            Ok(()) => error!(
                id = %id,
                job = %message.message().display_name(),
                queue = %message.queue(),
                attempts = message.attempts(),
                error = %err,
                "Delivery failed; stored as failed job"
            ),
            Err(store_err) => error!(
                job = %message.message().display_name(),
                queue = %message.queue(),
                error = %err,
                store_error = %store_err,
                "Delivery failed and could not be stored"
            ),
        }

        Err(err)
    }
}
