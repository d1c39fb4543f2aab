//! One in-flight delivery and its finalization state machine.
//!
//! ```text
//!   Active ──acknowledge()──▶ Acknowledged ──reject()──▶ Rejected
//!     │                                                    ▲
//!     ├──reject(requeue)───────────────────────────────────┤
//!     └──retry(delay)──(new delivery pushed)───────────────┘
//! ```
//!
//! The driver is called at most once per envelope to finalize the delivery;
//! every transition out of a finalized state only updates local state.

use crate::driver::QueueDriver;
use crate::error::QueueError;
use crate::message::{Message, QueuedMessage, CORRELATION_ID_HEADER, REPLY_TO_HEADER};
use serde_json::Value;
use std::sync::Arc;
use tracing::debug;

#[cfg(test)]
#[path = "envelope_tests.rs"]
mod tests;

/// Finalization state of a delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryState {
    /// Not finalized yet
    Active,
    /// Removed from the backend
    Acknowledged,
    /// Removed or released without being processed successfully
    Rejected,
}

/// A dequeued message bound to the driver that produced it
pub struct Envelope {
    message: QueuedMessage,
    driver: Arc<dyn QueueDriver>,
    state: DeliveryState,
}

impl std::fmt::Debug for Envelope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Envelope")
            .field("message", &self.message)
            .field("driver", &self.driver.kind())
            .field("state", &self.state)
            .finish()
    }
}

impl Envelope {
    pub fn new(message: QueuedMessage, driver: Arc<dyn QueueDriver>) -> Self {
        Self {
            message,
            driver,
            state: DeliveryState::Active,
        }
    }

    pub fn message(&self) -> &QueuedMessage {
        &self.message
    }

    pub fn state(&self) -> DeliveryState {
        self.state
    }

    pub fn is_deleted(&self) -> bool {
        self.state != DeliveryState::Active
    }

    pub fn is_rejected(&self) -> bool {
        self.state == DeliveryState::Rejected
    }

    /// Remove the delivery from the backend; a second call is a no-op
    pub async fn acknowledge(&mut self) -> Result<(), QueueError> {
        if self.state != DeliveryState::Active {
            return Ok(());
        }

        self.state = DeliveryState::Acknowledged;
        self.driver.acknowledge(&self.message).await
    }

    /// Mark the delivery as rejected.
    ///
    /// With `requeue` the message is released for redelivery, otherwise it is
    /// consumed. Nothing reaches the driver when the delivery is already
    /// finalized.
    pub async fn reject(&mut self, requeue: bool) -> Result<(), QueueError> {
        let was_active = self.state == DeliveryState::Active;
        self.state = DeliveryState::Rejected;

        if !was_active {
            return Ok(());
        }

        if requeue {
            self.driver.release(&self.message).await
        } else {
            self.driver.acknowledge(&self.message).await
        }
    }

    /// End this delivery and push a new one with an incremented attempt count
    pub async fn retry(&mut self, delay: u64) -> Result<(), QueueError> {
        self.reject(false).await?;

        self.message.increment_attempts();
        self.message.set_delay(delay);

        debug!(
            job = %self.message.message().display_name(),
            queue = %self.message.queue(),
            attempts = self.message.attempts(),
            delay,
            "Pushing retry delivery"
        );

        self.driver
            .push(self.message.message(), self.message.attempts())
            .await
    }

    /// Answer an RPC request and acknowledge it.
    ///
    /// Does nothing when the request carries no correlation headers or the
    /// delivery is already finalized.
    pub async fn reply(&mut self, payload: impl Into<Value>) -> Result<(), QueueError> {
        if self.state != DeliveryState::Active {
            return Ok(());
        }

        let request = self.message.message();
        let (Some(correlation_id), Some(reply_to)) = (
            request.header(CORRELATION_ID_HEADER),
            request.header(REPLY_TO_HEADER),
        ) else {
            return Ok(());
        };

        let mut response = Message::new(payload)
            .on_queue(reply_to)
            .with_header(CORRELATION_ID_HEADER, correlation_id);
        response.connection = request.connection.clone();

        self.driver.push(&response, 1).await?;
        self.acknowledge().await
    }
}
