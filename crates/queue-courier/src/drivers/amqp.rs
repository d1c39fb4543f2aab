//! AMQP queue driver.
//!
//! The driver speaks to the broker through the [`AmqpChannel`] port, which
//! covers the handful of AMQP 0-9-1 methods it needs. Applications plug in
//! an adapter over their AMQP client of choice; tests use an in-process fake.
//!
//! ## Delays
//!
//! Brokers have no native scheduled delivery. A message delayed by `n`
//! seconds is published to an auxiliary queue `<queue>.delay.<n>` declared
//! with `x-message-ttl = n * 1000` and a dead-letter route back to the real
//! queue. Once the TTL expires the broker moves the message over. Auxiliary
//! queues carry `x-expires` so unused ones disappear.
//!
//! ## Topics
//!
//! Topic messages go to one durable topic exchange. Every consumer group gets
//! its own queue `<group>.<topic>` bound with the topic as routing key, so
//! groups each receive a copy while workers in a group compete.

use crate::driver::{subscription_queue, DriverKind, DriverStats, QueueDriver, QueueStats};
use crate::error::{QueueError, SerializationError};
use crate::message::{Message, QueuedMessage, ReceiptHandle};
use crate::serializer::{JsonSerializer, MessageSerializer};
use async_trait::async_trait;
use bytes::Bytes;
use serde::Deserialize;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

#[cfg(test)]
#[path = "amqp_tests.rs"]
mod tests;

/// Extra lifetime of a delay queue after its messages expired, in milliseconds
const DELAY_QUEUE_GRACE_MS: u64 = 60_000;

// ============================================================================
// Channel Port
// ============================================================================

/// Exchange types used by the driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    Direct,
    Topic,
}

/// `x-*` arguments of a queue declaration
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct QueueArguments {
    /// `x-message-ttl` in milliseconds
    pub message_ttl: Option<u64>,
    /// `x-dead-letter-exchange`; the empty string is the default exchange
    pub dead_letter_exchange: Option<String>,
    /// `x-dead-letter-routing-key`
    pub dead_letter_routing_key: Option<String>,
    /// `x-expires` in milliseconds
    pub expires: Option<u64>,
}

/// `queue.declare` parameters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueueDeclaration {
    pub name: String,
    pub durable: bool,
    pub arguments: QueueArguments,
}

impl QueueDeclaration {
    pub fn durable(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            durable: true,
            arguments: QueueArguments::default(),
        }
    }
}

/// `basic.publish` properties
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PublishProperties {
    /// Delivery mode 2
    pub persistent: bool,
    pub content_type: Option<String>,
}

/// A message obtained with `basic.get`
#[derive(Debug, Clone)]
pub struct AmqpDelivery {
    pub delivery_tag: u64,
    pub body: Bytes,
    pub redelivered: bool,
}

/// Subset of an AMQP channel used by [`AmqpDriver`]
#[async_trait]
pub trait AmqpChannel: Send + Sync {
    async fn declare_queue(&self, declaration: &QueueDeclaration) -> Result<(), QueueError>;

    async fn declare_exchange(&self, name: &str, kind: ExchangeKind) -> Result<(), QueueError>;

    async fn bind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), QueueError>;

    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Bytes,
        properties: &PublishProperties,
    ) -> Result<(), QueueError>;

    /// `basic.get` without auto-ack
    async fn get(&self, queue: &str) -> Result<Option<AmqpDelivery>, QueueError>;

    async fn ack(&self, delivery_tag: u64) -> Result<(), QueueError>;

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), QueueError>;

    /// Ready message count reported by a passive declare
    async fn message_count(&self, queue: &str) -> Result<u64, QueueError>;

    async fn delete_queue(&self, queue: &str) -> Result<(), QueueError>;
}

// ============================================================================
// AmqpDriver
// ============================================================================

/// Options of the AMQP driver
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AmqpOptions {
    /// Topic exchange used for published messages
    pub exchange: String,
    /// Interval between two `basic.get` calls while a pop is waiting
    pub poll_interval_ms: u64,
    /// Publish with delivery mode 2
    pub persistent: bool,
}

impl Default for AmqpOptions {
    fn default() -> Self {
        Self {
            exchange: "courier".to_string(),
            poll_interval_ms: 100,
            persistent: true,
        }
    }
}

/// Name of the auxiliary queue holding messages for `target` delayed by `delay` seconds
pub fn delay_queue_name(target: &str, delay: u64) -> String {
    format!("{}.delay.{}", target, delay)
}

/// Queue driver for AMQP 0-9-1 brokers
pub struct AmqpDriver {
    channel: Arc<dyn AmqpChannel>,
    options: AmqpOptions,
    serializer: Arc<dyn MessageSerializer>,
    declared: Mutex<BTreeSet<String>>,
}

impl AmqpDriver {
    pub fn new(channel: Arc<dyn AmqpChannel>, options: AmqpOptions) -> Self {
        Self {
            channel,
            options,
            serializer: Arc::new(JsonSerializer),
            declared: Mutex::new(BTreeSet::new()),
        }
    }

    pub fn with_serializer(mut self, serializer: Arc<dyn MessageSerializer>) -> Self {
        self.serializer = serializer;
        self
    }

    fn properties(&self) -> PublishProperties {
        PublishProperties {
            persistent: self.options.persistent,
            content_type: Some("application/json".to_string()),
        }
    }

    fn declared(&self) -> Result<std::sync::MutexGuard<'_, BTreeSet<String>>, QueueError> {
        self.declared
            .lock()
            .map_err(|_| QueueError::poisoned(DriverKind::Amqp.as_str()))
    }

    /// Declare a durable work queue once per driver instance
    async fn ensure_queue(&self, queue: &str) -> Result<(), QueueError> {
        let known = self.declared()?.contains(queue);
        if known {
            return Ok(());
        }
        self.channel
            .declare_queue(&QueueDeclaration::durable(queue))
            .await?;
        self.declared()?.insert(queue.to_string());
        Ok(())
    }

    /// Declare the delay queue dead-lettering into `exchange` with `routing_key`
    async fn ensure_delay_queue(
        &self,
        exchange: &str,
        routing_key: &str,
        delay: u64,
    ) -> Result<String, QueueError> {
        let name = if exchange.is_empty() {
            delay_queue_name(routing_key, delay)
        } else {
            delay_queue_name(&format!("{}.{}", exchange, routing_key), delay)
        };

        let ttl = delay.saturating_mul(1000);
        let declaration = QueueDeclaration {
            name: name.clone(),
            durable: true,
            arguments: QueueArguments {
                message_ttl: Some(ttl),
                dead_letter_exchange: Some(exchange.to_string()),
                dead_letter_routing_key: Some(routing_key.to_string()),
                expires: Some(ttl.saturating_add(DELAY_QUEUE_GRACE_MS)),
            },
        };
        self.channel.declare_queue(&declaration).await?;
        Ok(name)
    }

    async fn ensure_exchange(&self) -> Result<(), QueueError> {
        self.channel
            .declare_exchange(&self.options.exchange, ExchangeKind::Topic)
            .await
    }

    /// Publish to `exchange`/`routing_key`, detouring through a delay queue when needed
    async fn send(
        &self,
        exchange: &str,
        routing_key: &str,
        raw: &str,
        delay: u64,
    ) -> Result<(), QueueError> {
        let body = Bytes::copy_from_slice(raw.as_bytes());
        let properties = self.properties();

        if delay == 0 {
            return self
                .channel
                .publish(exchange, routing_key, body, &properties)
                .await;
        }

        let delay_queue = self.ensure_delay_queue(exchange, routing_key, delay).await?;
        debug!(
            delay_queue = %delay_queue,
            routing_key = %routing_key,
            delay,
            "Publishing through delay queue"
        );
        self.channel
            .publish("", &delay_queue, body, &properties)
            .await
    }

    fn delivery_tag(message: &QueuedMessage) -> Result<u64, QueueError> {
        match message.handle() {
            Some(ReceiptHandle::Amqp { delivery_tag }) => Ok(*delivery_tag),
            other => Err(QueueError::MessageNotFound {
                receipt: other.map(ToString::to_string).unwrap_or_default(),
            }),
        }
    }

    fn decode(&self, delivery: AmqpDelivery, queue: &str) -> QueuedMessage {
        let handle = ReceiptHandle::Amqp {
            delivery_tag: delivery.delivery_tag,
        };
        let message = match String::from_utf8(delivery.body.to_vec()) {
            Ok(raw) => self.serializer.decode(raw, queue),
            Err(err) => {
                let raw = String::from_utf8_lossy(err.as_bytes()).into_owned();
                warn!(queue = %queue, "Delivery body is not valid UTF-8");
                QueuedMessage::from_error(raw, queue, SerializationError::InvalidUtf8)
            }
        };
        message.with_handle(handle)
    }
}

#[async_trait]
impl QueueDriver for AmqpDriver {
    async fn push(&self, message: &Message, attempts: u32) -> Result<(), QueueError> {
        let raw = self.serializer.serialize(message, attempts)?;
        self.push_raw(&raw, &message.queue, message.delay).await
    }

    async fn push_raw(&self, raw: &str, queue: &str, delay: u64) -> Result<(), QueueError> {
        self.ensure_queue(queue).await?;
        self.send("", queue, raw, delay).await
    }

    async fn pop(
        &self,
        queue: &str,
        duration: Duration,
    ) -> Result<Option<QueuedMessage>, QueueError> {
        self.ensure_queue(queue).await?;

        let deadline = Instant::now() + duration;
        let interval = Duration::from_millis(self.options.poll_interval_ms.max(1));
        loop {
            if let Some(delivery) = self.channel.get(queue).await? {
                return Ok(Some(self.decode(delivery, queue)));
            }

            let now = Instant::now();
            if now >= deadline {
                return Ok(None);
            }
            tokio::time::sleep(interval.min(deadline - now)).await;
        }
    }

    async fn acknowledge(&self, message: &QueuedMessage) -> Result<(), QueueError> {
        self.channel.ack(Self::delivery_tag(message)?).await
    }

    async fn release(&self, message: &QueuedMessage) -> Result<(), QueueError> {
        let delivery_tag = Self::delivery_tag(message)?;
        if message.delay() == 0 {
            return self.channel.nack(delivery_tag, true).await;
        }

        // The delay queue copy must exist before the original goes away.
        let raw = if message.is_error_message() {
            message.raw().to_string()
        } else {
            self.serializer
                .serialize(message.message(), message.attempts())?
        };
        self.send("", message.queue(), &raw, message.delay()).await?;
        self.channel.ack(delivery_tag).await
    }

    async fn count(&self, queue: &str) -> Result<Option<u64>, QueueError> {
        Ok(Some(self.channel.message_count(queue).await?))
    }

    async fn stats(&self) -> Result<DriverStats, QueueError> {
        let queues: Vec<String> = self.declared()?.iter().cloned().collect();
        let mut stats = Vec::with_capacity(queues.len());
        for queue in queues {
            let ready = self.channel.message_count(&queue).await?;
            stats.push(QueueStats {
                queue,
                ready,
                reserved: None,
                delayed: None,
            });
        }

        Ok(DriverStats {
            driver: Some(DriverKind::Amqp),
            queues: stats,
        })
    }

    async fn publish(&self, message: &Message) -> Result<(), QueueError> {
        let Some(topic) = message.topic.as_deref() else {
            return self.push(message, 1).await;
        };

        self.ensure_exchange().await?;
        let raw = self.serializer.serialize(message, 1)?;
        self.send(&self.options.exchange, topic, &raw, message.delay)
            .await
    }

    async fn subscribe(&self, topic: &str, group: &str) -> Result<String, QueueError> {
        let queue = subscription_queue(topic, group);
        self.ensure_exchange().await?;
        self.ensure_queue(&queue).await?;
        self.channel
            .bind_queue(&queue, &self.options.exchange, topic)
            .await?;
        Ok(queue)
    }

    async fn declare_queue(&self, queue: &str) -> Result<(), QueueError> {
        self.ensure_queue(queue).await
    }

    async fn delete_queue(&self, queue: &str) -> Result<(), QueueError> {
        self.channel.delete_queue(queue).await?;
        self.declared()?.remove(queue);
        Ok(())
    }

    fn kind(&self) -> DriverKind {
        DriverKind::Amqp
    }
}
