//! Driver contract and the connection facade built on top of it.
//!
//! Every backend implements [`QueueDriver`]. The guarantees differ per backend
//! and are part of the contract:
//!
//! | Driver   | Reservation exclusivity             | Delay                          |
//! |----------|-------------------------------------|--------------------------------|
//! | memory   | process-wide lock                   | per-message `available_at`     |
//! | database | `BEGIN IMMEDIATE` + guarded update  | `available_at` column          |
//! | redis    | atomic list pop                     | sorted set + migration script  |
//! | amqp     | broker delivery tracking            | TTL + dead-letter queue        |
//! | log      | consumer group partition ownership  | held record, blocks partition  |
//!
//! The log driver only acknowledges "up to and including" an offset; a
//! partition rebalance may redeliver anything after the last committed offset.

use crate::envelope::Envelope;
use crate::error::QueueError;
use crate::message::{Message, QueuedMessage};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

#[cfg(test)]
#[path = "driver_tests.rs"]
mod tests;

/// Enumeration of supported backend drivers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DriverKind {
    Memory,
    Database,
    Redis,
    Amqp,
    Log,
}

impl DriverKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Database => "database",
            Self::Redis => "redis",
            Self::Amqp => "amqp",
            Self::Log => "log",
        }
    }

    /// Check if the driver can hand out several messages in one call
    pub fn supports_reserve(&self) -> bool {
        matches!(self, Self::Memory | Self::Database)
    }

    /// Check if the driver can fan a message out to consumer groups
    pub fn supports_topics(&self) -> bool {
        matches!(self, Self::Memory | Self::Amqp | Self::Log)
    }
}

impl std::fmt::Display for DriverKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Per-queue counters reported by [`QueueDriver::stats`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub queue: String,
    /// Messages that are visible now
    pub ready: u64,
    /// Messages handed to a consumer and not yet finalized
    pub reserved: Option<u64>,
    /// Messages waiting for their due time
    pub delayed: Option<u64>,
}

/// Report returned by [`QueueDriver::stats`]
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DriverStats {
    pub driver: Option<DriverKind>,
    pub queues: Vec<QueueStats>,
}

impl DriverStats {
    pub fn queue(&self, name: &str) -> Option<&QueueStats> {
        self.queues.iter().find(|stats| stats.queue == name)
    }
}

/// Name of the queue a consumer group reads for a topic
pub fn subscription_queue(topic: &str, group: &str) -> String {
    format!("{}.{}", group, topic)
}

/// Interface implemented by specific backends
#[async_trait]
pub trait QueueDriver: Send + Sync {
    /// Encode and push a message to `message.queue`
    async fn push(&self, message: &Message, attempts: u32) -> Result<(), QueueError>;

    /// Push an already-encoded payload
    async fn push_raw(&self, raw: &str, queue: &str, delay: u64) -> Result<(), QueueError>;

    /// Take the next visible message, waiting at most `duration`
    async fn pop(
        &self,
        queue: &str,
        duration: Duration,
    ) -> Result<Option<QueuedMessage>, QueueError>;

    /// Take up to `count` visible messages, waiting at most `duration`
    async fn reserve(
        &self,
        count: usize,
        queue: &str,
        duration: Duration,
    ) -> Result<Vec<QueuedMessage>, QueueError> {
        if count == 0 {
            return Ok(Vec::new());
        }
        Ok(self.pop(queue, duration).await?.into_iter().collect())
    }

    /// Permanently remove or commit a delivery
    async fn acknowledge(&self, message: &QueuedMessage) -> Result<(), QueueError>;

    /// Make a delivery visible again after `message.delay()` seconds
    async fn release(&self, message: &QueuedMessage) -> Result<(), QueueError>;

    /// Number of pending messages, when the backend can tell
    async fn count(&self, queue: &str) -> Result<Option<u64>, QueueError>;

    /// Counters for the queues this driver knows about
    async fn stats(&self) -> Result<DriverStats, QueueError>;

    /// Deliver a message to every consumer group subscribed to its topic
    async fn publish(&self, message: &Message) -> Result<(), QueueError> {
        let _ = message;
        Err(QueueError::unsupported(self.kind().as_str(), "publish"))
    }

    /// Register a consumer group on a topic; returns the queue to consume
    async fn subscribe(&self, topic: &str, group: &str) -> Result<String, QueueError> {
        let _ = (topic, group);
        Err(QueueError::unsupported(self.kind().as_str(), "subscribe"))
    }

    /// Create the backing structures of a queue
    async fn declare_queue(&self, queue: &str) -> Result<(), QueueError> {
        let _ = queue;
        Ok(())
    }

    /// Drop a queue and its pending messages
    async fn delete_queue(&self, queue: &str) -> Result<(), QueueError> {
        let _ = queue;
        Err(QueueError::unsupported(self.kind().as_str(), "delete_queue"))
    }

    /// Get driver type
    fn kind(&self) -> DriverKind;
}

/// Named handle on a driver that turns deliveries into envelopes
///
/// # Examples
///
/// ```rust
/// use queue_courier::drivers::MemoryDriver;
/// use queue_courier::{Connection, Message};
/// use std::sync::Arc;
/// use std::time::Duration;
///
/// # tokio_test::block_on(async {
/// let connection = Connection::new("main", Arc::new(MemoryDriver::new()));
/// connection.push(Message::new("hello"), "q").await?;
///
/// let mut envelope = connection.pop("q", Duration::ZERO).await?.expect("pushed above");
/// assert_eq!(envelope.message().data(), "hello");
/// envelope.acknowledge().await?;
/// assert_eq!(connection.count("q").await?, Some(0));
/// # Ok::<(), queue_courier::QueueError>(())
/// # });
/// ```
#[derive(Clone)]
pub struct Connection {
    name: String,
    driver: Arc<dyn QueueDriver>,
}

impl std::fmt::Debug for Connection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Connection")
            .field("name", &self.name)
            .field("driver", &self.driver.kind())
            .finish()
    }
}

impl Connection {
    pub fn new(name: impl Into<String>, driver: Arc<dyn QueueDriver>) -> Self {
        Self {
            name: name.into(),
            driver,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn driver(&self) -> &Arc<dyn QueueDriver> {
        &self.driver
    }

    /// Send a message to its topic, or to its queue when no topic is set
    pub async fn send(&self, mut message: Message) -> Result<(), QueueError> {
        if message.connection.is_none() {
            message.connection = Some(self.name.clone());
        }

        if message.topic.is_some() {
            self.driver.publish(&message).await
        } else {
            self.driver.push(&message, 1).await
        }
    }

    /// Push a message to `queue` regardless of its own target
    pub async fn push(&self, message: Message, queue: &str) -> Result<(), QueueError> {
        self.send(message.on_queue(queue)).await
    }

    pub async fn push_raw(&self, raw: &str, queue: &str, delay: u64) -> Result<(), QueueError> {
        self.driver.push_raw(raw, queue, delay).await
    }

    pub async fn pop(
        &self,
        queue: &str,
        duration: Duration,
    ) -> Result<Option<Envelope>, QueueError> {
        Ok(self
            .driver
            .pop(queue, duration)
            .await?
            .map(|message| self.envelope(message)))
    }

    pub async fn reserve(
        &self,
        count: usize,
        queue: &str,
        duration: Duration,
    ) -> Result<Vec<Envelope>, QueueError> {
        Ok(self
            .driver
            .reserve(count, queue, duration)
            .await?
            .into_iter()
            .map(|message| self.envelope(message))
            .collect())
    }

    pub async fn count(&self, queue: &str) -> Result<Option<u64>, QueueError> {
        self.driver.count(queue).await
    }

    pub async fn stats(&self) -> Result<DriverStats, QueueError> {
        self.driver.stats().await
    }

    pub async fn subscribe(&self, topic: &str, group: &str) -> Result<String, QueueError> {
        self.driver.subscribe(topic, group).await
    }

    fn envelope(&self, mut message: QueuedMessage) -> Envelope {
        if message.message().connection.is_none() {
            message.message_mut().connection = Some(self.name.clone());
        }
        Envelope::new(message, Arc::clone(&self.driver))
    }
}

/// Where a consumer reads from
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Destination {
    Queue { queue: String },
    Topic { topic: String, group: String },
}

impl Destination {
    pub fn queue(name: impl Into<String>) -> Self {
        Self::Queue { queue: name.into() }
    }

    pub fn topic(topic: impl Into<String>, group: impl Into<String>) -> Self {
        Self::Topic {
            topic: topic.into(),
            group: group.into(),
        }
    }

    /// Resolve the queue to pop from, subscribing the group when needed
    pub async fn resolve(&self, connection: &Connection) -> Result<String, QueueError> {
        match self {
            Self::Queue { queue } => {
                connection.driver().declare_queue(queue).await?;
                Ok(queue.clone())
            }
            Self::Topic { topic, group } => connection.subscribe(topic, group).await,
        }
    }
}

impl std::fmt::Display for Destination {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Queue { queue } => write!(f, "queue:{}", queue),
            Self::Topic { topic, group } => write!(f, "topic:{}@{}", topic, group),
        }
    }
}
