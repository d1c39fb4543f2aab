//! In-memory queue driver implementation for testing and development.
//!
//! This module provides a fully functional in-process driver that:
//! - Keeps each queue in FIFO order with a per-message due time
//! - Tracks reserved deliveries until they are acknowledged or released
//! - Fans topic messages out to one queue per subscribed consumer group
//! - Provides thread-safe concurrent access
//!
//! Reservation exclusivity comes from the storage lock: a message moves from
//! the ready list to the reserved map inside a single critical section.

use crate::driver::{subscription_queue, DriverKind, DriverStats, QueueDriver, QueueStats};
use crate::error::QueueError;
use crate::message::{Message, MessageId, QueuedMessage, ReceiptHandle, Timestamp};
use crate::serializer::{JsonSerializer, MessageSerializer};
use async_trait::async_trait;
use std::collections::{BTreeMap, BTreeSet, HashMap, VecDeque};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::time::Instant;

#[cfg(test)]
#[path = "memory_tests.rs"]
mod tests;

/// Interval between two looks at an empty queue while a pop is waiting
const POLL_INTERVAL: Duration = Duration::from_millis(20);

// ============================================================================
// Internal Storage Structures
// ============================================================================

/// Thread-safe storage for all queues
#[derive(Default)]
struct QueueStorage {
    queues: BTreeMap<String, InMemoryQueue>,
    subscriptions: HashMap<String, BTreeSet<String>>,
}

impl QueueStorage {
    /// Get or create a queue
    fn get_or_create_queue(&mut self, queue_name: &str) -> &mut InMemoryQueue {
        self.queues.entry(queue_name.to_string()).or_default()
    }
}

/// Internal queue state for a single queue
#[derive(Default)]
struct InMemoryQueue {
    /// Pending messages in push order
    messages: VecDeque<StoredMessage>,
    /// Messages handed to a consumer, keyed by reservation id
    reserved: HashMap<MessageId, StoredMessage>,
}

impl InMemoryQueue {
    /// Remove and return the oldest message whose due time has passed
    fn take_available(&mut self, now: Timestamp) -> Option<StoredMessage> {
        let index = self
            .messages
            .iter()
            .position(|stored| stored.is_available(now))?;
        self.messages.remove(index)
    }

    fn delayed(&self, now: Timestamp) -> u64 {
        self.messages
            .iter()
            .filter(|stored| !stored.is_available(now))
            .count() as u64
    }
}

/// A raw payload stored in the queue with metadata
#[derive(Clone)]
struct StoredMessage {
    id: MessageId,
    raw: String,
    available_at: Timestamp,
}

impl StoredMessage {
    fn new(raw: &str, delay: u64) -> Self {
        Self {
            id: MessageId::new(),
            raw: raw.to_string(),
            available_at: Timestamp::now().add_seconds(delay),
        }
    }

    /// Check if message is available for receiving
    fn is_available(&self, now: Timestamp) -> bool {
        now >= self.available_at
    }
}

// ============================================================================
// MemoryDriver
// ============================================================================

/// In-memory queue driver implementation
#[derive(Clone)]
pub struct MemoryDriver {
    storage: Arc<RwLock<QueueStorage>>,
    serializer: Arc<dyn MessageSerializer>,
}

impl MemoryDriver {
    /// Create new in-memory driver with the JSON serializer
    pub fn new() -> Self {
        Self::with_serializer(Arc::new(JsonSerializer))
    }

    pub fn with_serializer(serializer: Arc<dyn MessageSerializer>) -> Self {
        Self {
            storage: Arc::new(RwLock::new(QueueStorage::default())),
            serializer,
        }
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, QueueStorage>, QueueError> {
        self.storage
            .write()
            .map_err(|_| QueueError::poisoned(DriverKind::Memory.as_str()))
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, QueueStorage>, QueueError> {
        self.storage
            .read()
            .map_err(|_| QueueError::poisoned(DriverKind::Memory.as_str()))
    }

    /// Move up to `count` due messages into the reserved map
    fn take(&self, count: usize, queue: &str) -> Result<Vec<QueuedMessage>, QueueError> {
        let now = Timestamp::now();
        let mut storage = self.write()?;
        let state = storage.get_or_create_queue(queue);

        let mut taken = Vec::new();
        while taken.len() < count {
            let Some(stored) = state.take_available(now) else {
                break;
            };
            let handle = ReceiptHandle::Memory {
                id: stored.id.clone(),
            };
            taken.push((stored.raw.clone(), handle));
            state.reserved.insert(stored.id.clone(), stored);
        }
        drop(storage);

        Ok(taken
            .into_iter()
            .map(|(raw, handle)| self.serializer.decode(raw, queue).with_handle(handle))
            .collect())
    }

    fn reservation_id(message: &QueuedMessage) -> Result<&MessageId, QueueError> {
        match message.handle() {
            Some(ReceiptHandle::Memory { id }) => Ok(id),
            other => Err(QueueError::MessageNotFound {
                receipt: other.map(ToString::to_string).unwrap_or_default(),
            }),
        }
    }
}

impl Default for MemoryDriver {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl QueueDriver for MemoryDriver {
    async fn push(&self, message: &Message, attempts: u32) -> Result<(), QueueError> {
        let raw = self.serializer.serialize(message, attempts)?;
        self.push_raw(&raw, &message.queue, message.delay).await
    }

    async fn push_raw(&self, raw: &str, queue: &str, delay: u64) -> Result<(), QueueError> {
        let mut storage = self.write()?;
        storage
            .get_or_create_queue(queue)
            .messages
            .push_back(StoredMessage::new(raw, delay));
        Ok(())
    }

    async fn pop(
        &self,
        queue: &str,
        duration: Duration,
    ) -> Result<Option<QueuedMessage>, QueueError> {
        Ok(self.reserve(1, queue, duration).await?.into_iter().next())
    }

    async fn reserve(
        &self,
        count: usize,
        queue: &str,
        duration: Duration,
    ) -> Result<Vec<QueuedMessage>, QueueError> {
        if count == 0 {
            return Ok(Vec::new());
        }

        let deadline = Instant::now() + duration;
        loop {
            let taken = self.take(count, queue)?;
            if !taken.is_empty() {
                return Ok(taken);
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(Vec::new());
            }
            tokio::time::sleep(POLL_INTERVAL.min(deadline - now)).await;
        }
    }

    async fn acknowledge(&self, message: &QueuedMessage) -> Result<(), QueueError> {
        let id = Self::reservation_id(message)?;
        let mut storage = self.write()?;
        let removed = storage
            .queues
            .get_mut(message.queue())
            .and_then(|state| state.reserved.remove(id));

        match removed {
            Some(_) => Ok(()),
            None => Err(QueueError::MessageNotFound {
                receipt: id.to_string(),
            }),
        }
    }

    async fn release(&self, message: &QueuedMessage) -> Result<(), QueueError> {
        let id = Self::reservation_id(message)?;
        let mut storage = self.write()?;
        let state = storage
            .queues
            .get_mut(message.queue())
            .ok_or_else(|| QueueError::QueueNotFound {
                queue_name: message.queue().to_string(),
            })?;

        let mut stored = state
            .reserved
            .remove(id)
            .ok_or_else(|| QueueError::MessageNotFound {
                receipt: id.to_string(),
            })?;
        stored.available_at = Timestamp::now().add_seconds(message.delay());
        state.messages.push_back(stored);
        Ok(())
    }

    async fn count(&self, queue: &str) -> Result<Option<u64>, QueueError> {
        let storage = self.read()?;
        Ok(Some(storage.queues.get(queue).map_or(0, |state| {
            (state.messages.len() + state.reserved.len()) as u64
        })))
    }

    async fn stats(&self) -> Result<DriverStats, QueueError> {
        let now = Timestamp::now();
        let storage = self.read()?;
        let queues = storage
            .queues
            .iter()
            .map(|(name, state)| {
                let delayed = state.delayed(now);
                QueueStats {
                    queue: name.clone(),
                    ready: state.messages.len() as u64 - delayed,
                    reserved: Some(state.reserved.len() as u64),
                    delayed: Some(delayed),
                }
            })
            .collect();

        Ok(DriverStats {
            driver: Some(DriverKind::Memory),
            queues,
        })
    }

    async fn publish(&self, message: &Message) -> Result<(), QueueError> {
        let Some(topic) = message.topic.as_deref() else {
            return self.push(message, 1).await;
        };

        let groups: Vec<String> = self
            .read()?
            .subscriptions
            .get(topic)
            .map(|groups| groups.iter().cloned().collect())
            .unwrap_or_default();

        if groups.is_empty() {
            tracing::debug!(topic = %topic, "Topic has no subscribers; message dropped");
            return Ok(());
        }

        for group in groups {
            let mut copy = message.clone();
            copy.queue = subscription_queue(topic, &group);
            self.push(&copy, 1).await?;
        }
        Ok(())
    }

    async fn subscribe(&self, topic: &str, group: &str) -> Result<String, QueueError> {
        let queue = subscription_queue(topic, group);
        let mut storage = self.write()?;
        storage
            .subscriptions
            .entry(topic.to_string())
            .or_default()
            .insert(group.to_string());
        storage.get_or_create_queue(&queue);
        Ok(queue)
    }

    async fn declare_queue(&self, queue: &str) -> Result<(), QueueError> {
        self.write()?.get_or_create_queue(queue);
        Ok(())
    }

    async fn delete_queue(&self, queue: &str) -> Result<(), QueueError> {
        self.write()?.queues.remove(queue);
        Ok(())
    }

    fn kind(&self) -> DriverKind {
        DriverKind::Memory
    }
}
