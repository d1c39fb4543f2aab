//! Log broker (Kafka-style) queue driver.
//!
//! Queues map to topics and consumers read through a consumer group. The
//! driver talks to the broker through the [`LogClient`] port.
//!
//! ## Weaker guarantees
//!
//! - Acknowledge commits the consumer group offset *after* the record, which
//!   acknowledges every earlier record of the partition as well.
//! - A reserved record is exclusive only as long as the partition stays
//!   assigned to this consumer; a rebalance redelivers everything after the
//!   last committed offset.
//! - There is no native delay. Delayed messages carry an `available-at`
//!   header. A polled record that is not due yet is held by the driver and
//!   nothing else is read from that topic until it is due, so a delayed record
//!   blocks everything queued behind it.
//! - Release re-produces the message with the same key, so it lands on the
//!   same partition, then commits the original record.

use crate::driver::{DriverKind, DriverStats, QueueDriver, QueueStats};
use crate::error::{QueueError, SerializationError};
use crate::message::{Message, MessageId, QueuedMessage, ReceiptHandle, Timestamp};
use crate::serializer::{JsonSerializer, MessageSerializer};
use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

#[cfg(test)]
#[path = "log_tests.rs"]
mod tests;

/// Header holding the epoch millisecond a record becomes due
pub const AVAILABLE_AT_HEADER: &str = "available-at";

// ============================================================================
// Client Port
// ============================================================================

/// How offsets are committed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommitMode {
    /// Wait for the broker to confirm the commit
    #[default]
    Sync,
    /// Hand the commit to the client and return immediately
    Async,
}

/// Record to append to a topic
#[derive(Debug, Clone, PartialEq)]
pub struct ProducerRecord {
    pub topic: String,
    /// Partitioning key
    pub key: Option<String>,
    pub payload: Bytes,
    pub headers: HashMap<String, String>,
}

/// Record read from a partition
#[derive(Debug, Clone, PartialEq)]
pub struct LogRecord {
    pub topic: String,
    pub partition: i32,
    pub offset: i64,
    pub key: Option<String>,
    pub payload: Bytes,
    pub headers: HashMap<String, String>,
}

/// Subset of a log broker client used by [`LogDriver`]
#[async_trait]
pub trait LogClient: Send + Sync {
    async fn produce(&self, record: ProducerRecord) -> Result<(), QueueError>;

    /// Join `group` on `topic`; called once before the first poll
    async fn subscribe(&self, topic: &str, group: &str) -> Result<(), QueueError>;

    /// Next record for the group, waiting at most `timeout`
    async fn poll(
        &self,
        topic: &str,
        group: &str,
        timeout: Duration,
    ) -> Result<Option<LogRecord>, QueueError>;

    /// Commit `offset` as the next position of the group on a partition
    async fn commit(
        &self,
        topic: &str,
        group: &str,
        partition: i32,
        offset: i64,
        mode: CommitMode,
    ) -> Result<(), QueueError>;

    /// Records not yet committed by the group
    async fn lag(&self, topic: &str, group: &str) -> Result<u64, QueueError>;
}

// ============================================================================
// LogDriver
// ============================================================================

/// Options of the log driver
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogOptions {
    /// Consumer group used for topics nobody subscribed explicitly
    pub group: String,
    pub commit_mode: CommitMode,
}

impl Default for LogOptions {
    fn default() -> Self {
        Self {
            group: "courier".to_string(),
            commit_mode: CommitMode::Sync,
        }
    }
}

#[derive(Default)]
struct ConsumerState {
    /// Consumer group per topic
    groups: BTreeMap<String, String>,
    /// Polled records waiting for their due time, per topic
    held: HashMap<String, LogRecord>,
}

/// Queue driver for log brokers
pub struct LogDriver {
    client: Arc<dyn LogClient>,
    options: LogOptions,
    serializer: Arc<dyn MessageSerializer>,
    state: Mutex<ConsumerState>,
}

impl LogDriver {
    pub fn new(client: Arc<dyn LogClient>, options: LogOptions) -> Self {
        Self {
            client,
            options,
            serializer: Arc::new(JsonSerializer),
            state: Mutex::new(ConsumerState::default()),
        }
    }

    pub fn with_serializer(mut self, serializer: Arc<dyn MessageSerializer>) -> Self {
        self.serializer = serializer;
        self
    }

    fn state(&self) -> Result<std::sync::MutexGuard<'_, ConsumerState>, QueueError> {
        self.state
            .lock()
            .map_err(|_| QueueError::poisoned(DriverKind::Log.as_str()))
    }

    /// Consumer group of `topic`, joining the default group on first use
    async fn group(&self, topic: &str) -> Result<String, QueueError> {
        let existing = self.state()?.groups.get(topic).cloned();
        if let Some(group) = existing {
            return Ok(group);
        }

        let group = self.options.group.clone();
        self.client.subscribe(topic, &group).await?;
        self.state()?
            .groups
            .insert(topic.to_string(), group.clone());
        Ok(group)
    }

    fn available_at(record: &LogRecord) -> Option<Timestamp> {
        record
            .headers
            .get(AVAILABLE_AT_HEADER)
            .and_then(|value| value.parse::<i64>().ok())
            .map(Timestamp::from_millis)
    }

    fn record(topic: &str, key: &str, raw: &str, delay: u64) -> ProducerRecord {
        let mut headers = HashMap::new();
        if delay > 0 {
            let due = Timestamp::now().add_seconds(delay);
            headers.insert(AVAILABLE_AT_HEADER.to_string(), due.as_millis().to_string());
        }
        ProducerRecord {
            topic: topic.to_string(),
            key: Some(key.to_string()),
            payload: Bytes::copy_from_slice(raw.as_bytes()),
            headers,
        }
    }

    fn decode(&self, record: LogRecord) -> QueuedMessage {
        let handle = ReceiptHandle::Log {
            topic: record.topic.clone(),
            partition: record.partition,
            offset: record.offset,
        };
        let message = match String::from_utf8(record.payload.to_vec()) {
            Ok(raw) => self.serializer.decode(raw, &record.topic),
            Err(err) => {
                let raw = String::from_utf8_lossy(err.as_bytes()).into_owned();
                warn!(topic = %record.topic, "Record payload is not valid UTF-8");
                QueuedMessage::from_error(raw, &record.topic, SerializationError::InvalidUtf8)
            }
        };
        message.with_handle(handle)
    }

    /// Wait for the held record of `topic` until it is due or the deadline passes
    async fn wait_for_held(
        &self,
        topic: &str,
        deadline: Instant,
    ) -> Result<Option<QueuedMessage>, QueueError> {
        let due = {
            let state = self.state()?;
            match state.held.get(topic) {
                Some(record) => Self::available_at(record),
                None => return Ok(None),
            }
        };

        let wait = due
            .map(|due| due.as_millis() - Timestamp::now().as_millis())
            .filter(|millis| *millis > 0)
            .map(|millis| Duration::from_millis(millis as u64))
            .unwrap_or_default();

        let now = Instant::now();
        if now + wait > deadline {
            tokio::time::sleep(deadline.saturating_duration_since(now)).await;
            return Ok(None);
        }

        tokio::time::sleep(wait).await;
        let record = self.state()?.held.remove(topic);
        Ok(record.map(|record| self.decode(record)))
    }

    fn location(message: &QueuedMessage) -> Result<(&str, i32, i64), QueueError> {
        match message.handle() {
            Some(ReceiptHandle::Log {
                topic,
                partition,
                offset,
            }) => Ok((topic, *partition, *offset)),
            other => Err(QueueError::MessageNotFound {
                receipt: other.map(ToString::to_string).unwrap_or_default(),
            }),
        }
    }
}

#[async_trait]
impl QueueDriver for LogDriver {
    async fn push(&self, message: &Message, attempts: u32) -> Result<(), QueueError> {
        let raw = self.serializer.serialize(message, attempts)?;
        let topic = message.topic.as_deref().unwrap_or(&message.queue);
        let record = Self::record(topic, message.id.as_str(), &raw, message.delay);
        self.client.produce(record).await
    }

    async fn push_raw(&self, raw: &str, queue: &str, delay: u64) -> Result<(), QueueError> {
        let key = MessageId::new();
        let record = Self::record(queue, key.as_str(), raw, delay);
        self.client.produce(record).await
    }

    async fn pop(
        &self,
        queue: &str,
        duration: Duration,
    ) -> Result<Option<QueuedMessage>, QueueError> {
        let group = self.group(queue).await?;
        let deadline = Instant::now() + duration;

        let held = self.state()?.held.contains_key(queue);
        if held {
            return self.wait_for_held(queue, deadline).await;
        }

        let Some(record) = self.client.poll(queue, &group, duration).await? else {
            return Ok(None);
        };

        let due = Self::available_at(&record);
        if due.is_some_and(|due| due > Timestamp::now()) {
            debug!(
                topic = %record.topic,
                partition = record.partition,
                offset = record.offset,
                "Holding record until due"
            );
            self.state()?.held.insert(queue.to_string(), record);
            return self.wait_for_held(queue, deadline).await;
        }

        Ok(Some(self.decode(record)))
    }

    async fn acknowledge(&self, message: &QueuedMessage) -> Result<(), QueueError> {
        let (topic, partition, offset) = Self::location(message)?;
        let group = self.group(topic).await?;
        self.client
            .commit(topic, &group, partition, offset + 1, self.options.commit_mode)
            .await
    }

    async fn release(&self, message: &QueuedMessage) -> Result<(), QueueError> {
        let (topic, _, _) = Self::location(message)?;
        let raw = if message.is_error_message() {
            message.raw().to_string()
        } else {
            self.serializer
                .serialize(message.message(), message.attempts())?
        };

        let record = Self::record(topic, message.message().id.as_str(), &raw, message.delay());
        self.client.produce(record).await?;
        self.acknowledge(message).await
    }

    async fn count(&self, queue: &str) -> Result<Option<u64>, QueueError> {
        let group = self.group(queue).await?;
        Ok(Some(self.client.lag(queue, &group).await?))
    }

    async fn stats(&self) -> Result<DriverStats, QueueError> {
        let groups: Vec<(String, String)> = self
            .state()?
            .groups
            .iter()
            .map(|(topic, group)| (topic.clone(), group.clone()))
            .collect();

        let mut queues = Vec::with_capacity(groups.len());
        for (topic, group) in groups {
            let ready = self.client.lag(&topic, &group).await?;
            queues.push(QueueStats {
                queue: topic,
                ready,
                reserved: None,
                delayed: None,
            });
        }

        Ok(DriverStats {
            driver: Some(DriverKind::Log),
            queues,
        })
    }

    async fn publish(&self, message: &Message) -> Result<(), QueueError> {
        self.push(message, 1).await
    }

    /// The topic is the queue; the group becomes this driver's group for it
    async fn subscribe(&self, topic: &str, group: &str) -> Result<String, QueueError> {
        self.client.subscribe(topic, group).await?;
        self.state()?
            .groups
            .insert(topic.to_string(), group.to_string());
        Ok(topic.to_string())
    }

    fn kind(&self) -> DriverKind {
        DriverKind::Log
    }
}
