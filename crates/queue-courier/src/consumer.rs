//! Consumer of one destination: pops deliveries and feeds them to a chain.

use crate::driver::{Connection, Destination};
use crate::envelope::DeliveryState;
use crate::error::{ProcessError, QueueError};
use crate::receiver::Chain;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

#[cfg(test)]
#[path = "consumer_tests.rs"]
mod tests;

/// Cooperative stop flag shared by a consumer, its receivers and signal handlers
#[derive(Debug, Clone, Default)]
pub struct StopHandle {
    stopped: Arc<AtomicBool>,
}

impl StopHandle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Request a stop; takes effect before the next poll
    pub fn stop(&self) {
        self.stopped.store(true, Ordering::SeqCst);
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::SeqCst)
    }

    /// Clear the flag so the consumer can run again
    pub fn reset(&self) {
        self.stopped.store(false, Ordering::SeqCst);
    }
}

/// Reads one queue of a connection through a receiver chain
pub struct QueueConsumer {
    connection: Connection,
    queue: String,
    chain: Arc<dyn Chain>,
    stop: StopHandle,
}

impl QueueConsumer {
    pub fn new(connection: Connection, queue: impl Into<String>, chain: Arc<dyn Chain>) -> Self {
        Self {
            connection,
            queue: queue.into(),
            chain,
            stop: StopHandle::new(),
        }
    }

    /// Resolve `destination` on `connection`, subscribing to topics as needed
    pub async fn for_destination(
        connection: Connection,
        destination: &Destination,
        chain: Arc<dyn Chain>,
    ) -> Result<Self, QueueError> {
        let queue = destination.resolve(&connection).await?;
        debug!(destination = %destination, queue = %queue, "Resolved consumer queue");
        Ok(Self::new(connection, queue, chain))
    }

    pub fn queue(&self) -> &str {
        &self.queue
    }

    pub fn connection(&self) -> &Connection {
        &self.connection
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn stop(&self) {
        self.stop.stop();
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.is_stopped()
    }

    /// Run one poll cycle: wait up to `duration` for a delivery and hand it to
    /// the chain, or signal a timeout to the chain when nothing arrived.
    ///
    /// A delivery the chain leaves active (a chain without a processor) is
    /// released for redelivery.
    pub async fn consume(&self, duration: Duration) -> Result<(), ProcessError> {
        let next = self.chain.entry(&self.stop);
        let Some(mut envelope) = self.connection.pop(&self.queue, duration).await? else {
            return next.receive_timeout().await;
        };

        let result = next.receive(&mut envelope).await;
        if result.is_ok() && envelope.state() == DeliveryState::Active {
            warn!(
                queue = %self.queue,
                id = %envelope.message().message().id,
                "Chain returned without finalizing the delivery; releasing it"
            );
            envelope.reject(true).await?;
        }
        result
    }

    pub async fn start(&self) -> Result<(), ProcessError> {
        self.chain.entry(&self.stop).start().await
    }

    pub async fn receive_stop(&self) -> Result<(), ProcessError> {
        self.chain.entry(&self.stop).receive_stop().await
    }

    pub async fn terminate(&self) -> Result<(), ProcessError> {
        self.chain.entry(&self.stop).terminate().await
    }
}
