//! Redis queue driver using a ready list and a delayed sorted set.
//!
//! ## Key layout
//!
//! - `{prefix}{queue}` is the ready list, consumed from the head
//! - `{prefix}{queue}:delayed` is a sorted set scored by due epoch seconds
//!
//! Delayed members are stored as `{uuid}:{raw}` so identical payloads pushed
//! twice stay two members; the prefix is stripped when a member is migrated.
//!
//! Before every pop a Lua script moves due members from the sorted set to the
//! tail of the list in batches. Each member is removed from the set before it
//! is pushed, so a batch that is retried never schedules an entry twice.
//!
//! A pop is final: the payload leaves Redis when it is handed out.
//! Acknowledge is therefore a no-op, and release pushes the message again as a
//! new delivery. Attempt bookkeeping stays with the envelope.

use crate::driver::{DriverKind, DriverStats, QueueDriver, QueueStats};
use crate::error::QueueError;
use crate::message::{Message, QueuedMessage, ReceiptHandle, Timestamp};
use crate::serializer::{JsonSerializer, MessageSerializer};
use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client, Script};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, info};

#[cfg(test)]
#[path = "redis_tests.rs"]
mod tests;

/// Moves at most `ARGV[2]` members scored at or below `ARGV[1]`, without
/// their unique prefix, and returns how many were moved.
const MIGRATE_SCRIPT: &str = r"
local due = redis.call('ZRANGEBYSCORE', KEYS[2], '-inf', ARGV[1], 'LIMIT', 0, ARGV[2])
for _, member in ipairs(due) do
    redis.call('ZREM', KEYS[2], member)
    local separator = string.find(member, ':', 1, true)
    redis.call('RPUSH', KEYS[1], string.sub(member, separator + 1))
end
return #due
";

/// Sorted-set member of a delayed payload
fn delayed_member(raw: &str) -> String {
    format!("{}:{}", uuid::Uuid::new_v4(), raw)
}

/// Payload of a delayed member, mirroring the strip done by `MIGRATE_SCRIPT`
#[cfg(test)]
fn delayed_payload(member: &str) -> &str {
    member.split_once(':').map_or(member, |(_, raw)| raw)
}

/// Options of the Redis driver
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct RedisOptions {
    /// Prepended to every queue key
    pub prefix: String,
    /// Maximum number of delayed members moved per script call
    pub migrate_batch: usize,
}

impl Default for RedisOptions {
    fn default() -> Self {
        Self {
            prefix: "queues:".to_string(),
            migrate_batch: 100,
        }
    }
}

impl From<redis::RedisError> for QueueError {
    fn from(err: redis::RedisError) -> Self {
        if err.is_io_error()
            || err.is_timeout()
            || err.is_connection_dropped()
            || err.is_connection_refusal()
        {
            return QueueError::ConnectionFailed {
                message: err.to_string(),
            };
        }

        QueueError::ProviderError {
            provider: DriverKind::Redis.as_str().to_string(),
            code: err.code().unwrap_or("Redis").to_string(),
            message: err.to_string(),
        }
    }
}

/// Redis keys backing one queue
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct QueueKeys {
    pub ready: String,
    pub delayed: String,
}

impl QueueKeys {
    pub(crate) fn new(prefix: &str, queue: &str) -> Self {
        let ready = format!("{}{}", prefix, queue);
        let delayed = format!("{}:delayed", ready);
        Self { ready, delayed }
    }
}

/// Sorted set score of a message due `delay` seconds from `now`
pub(crate) fn due_score(now: Timestamp, delay: u64) -> f64 {
    now.add_seconds(delay).as_millis() as f64 / 1000.0
}

/// Queue driver for Redis lists
#[derive(Clone)]
pub struct RedisDriver {
    connection: ConnectionManager,
    options: RedisOptions,
    serializer: Arc<dyn MessageSerializer>,
    known_queues: Arc<Mutex<BTreeSet<String>>>,
}

impl RedisDriver {
    pub fn new(connection: ConnectionManager, options: RedisOptions) -> Self {
        Self {
            connection,
            options,
            serializer: Arc::new(JsonSerializer),
            known_queues: Arc::new(Mutex::new(BTreeSet::new())),
        }
    }

    /// Open a managed connection to `url`
    pub async fn connect(url: &str, options: RedisOptions) -> Result<Self, QueueError> {
        info!(url = %url, "Connecting Redis queue driver");
        let client = Client::open(url)?;
        let connection = ConnectionManager::new(client).await?;
        Ok(Self::new(connection, options))
    }

    pub fn with_serializer(mut self, serializer: Arc<dyn MessageSerializer>) -> Self {
        self.serializer = serializer;
        self
    }

    fn keys(&self, queue: &str) -> QueueKeys {
        QueueKeys::new(&self.options.prefix, queue)
    }

    fn remember(&self, queue: &str) -> Result<(), QueueError> {
        self.known_queues
            .lock()
            .map_err(|_| QueueError::poisoned(DriverKind::Redis.as_str()))?
            .insert(queue.to_string());
        Ok(())
    }

    fn forget(&self, queue: &str) -> Result<(), QueueError> {
        self.known_queues
            .lock()
            .map_err(|_| QueueError::poisoned(DriverKind::Redis.as_str()))?
            .remove(queue);
        Ok(())
    }

    /// Move every due delayed member onto the ready list
    async fn migrate_due(&self, keys: &QueueKeys) -> Result<(), QueueError> {
        let script = Script::new(MIGRATE_SCRIPT);
        let mut conn = self.connection.clone();
        let batch = self.options.migrate_batch.max(1);
        let now = due_score(Timestamp::now(), 0);

        loop {
            let moved: usize = script
                .key(&keys.ready)
                .key(&keys.delayed)
                .arg(now)
                .arg(batch)
                .invoke_async(&mut conn)
                .await?;

            if moved > 0 {
                debug!(queue = %keys.ready, moved, "Migrated due delayed messages");
            }
            if moved < batch {
                return Ok(());
            }
        }
    }
}

#[async_trait]
impl QueueDriver for RedisDriver {
    async fn push(&self, message: &Message, attempts: u32) -> Result<(), QueueError> {
        let raw = self.serializer.serialize(message, attempts)?;
        self.push_raw(&raw, &message.queue, message.delay).await
    }

    async fn push_raw(&self, raw: &str, queue: &str, delay: u64) -> Result<(), QueueError> {
        self.remember(queue)?;
        let keys = self.keys(queue);
        let mut conn = self.connection.clone();

        if delay == 0 {
            let _: i64 = conn.rpush(&keys.ready, raw).await?;
        } else {
            let score = due_score(Timestamp::now(), delay);
            let _: i64 = conn.zadd(&keys.delayed, delayed_member(raw), score).await?;
        }
        Ok(())
    }

    async fn pop(
        &self,
        queue: &str,
        duration: Duration,
    ) -> Result<Option<QueuedMessage>, QueueError> {
        self.remember(queue)?;
        let keys = self.keys(queue);
        self.migrate_due(&keys).await?;

        let mut conn = self.connection.clone();
        let raw: Option<String> = if duration.is_zero() {
            conn.lpop(&keys.ready, None).await?
        } else {
            // BLPOP treats a zero timeout as "forever"; never round down to it.
            let timeout = duration.as_secs_f64().max(0.001);
            let popped: Option<(String, String)> = redis::cmd("BLPOP")
                .arg(&keys.ready)
                .arg(timeout)
                .query_async(&mut conn)
                .await?;
            popped.map(|(_, raw)| raw)
        };

        Ok(raw.map(|raw| {
            self.serializer
                .decode(raw, queue)
                .with_handle(ReceiptHandle::Redis)
        }))
    }

    async fn acknowledge(&self, _message: &QueuedMessage) -> Result<(), QueueError> {
        Ok(())
    }

    async fn release(&self, message: &QueuedMessage) -> Result<(), QueueError> {
        if message.is_error_message() {
            return self
                .push_raw(message.raw(), message.queue(), message.delay())
                .await;
        }
        self.push(message.message(), message.attempts()).await
    }

    async fn count(&self, queue: &str) -> Result<Option<u64>, QueueError> {
        let keys = self.keys(queue);
        let mut conn = self.connection.clone();
        let ready: u64 = conn.llen(&keys.ready).await?;
        let delayed: u64 = conn.zcard(&keys.delayed).await?;
        Ok(Some(ready + delayed))
    }

    async fn stats(&self) -> Result<DriverStats, QueueError> {
        let queues: Vec<String> = self
            .known_queues
            .lock()
            .map_err(|_| QueueError::poisoned(DriverKind::Redis.as_str()))?
            .iter()
            .cloned()
            .collect();

        let mut conn = self.connection.clone();
        let mut stats = Vec::with_capacity(queues.len());
        for queue in queues {
            let keys = self.keys(&queue);
            let ready: u64 = conn.llen(&keys.ready).await?;
            let delayed: u64 = conn.zcard(&keys.delayed).await?;
            stats.push(QueueStats {
                queue,
                ready,
                reserved: None,
                delayed: Some(delayed),
            });
        }

        Ok(DriverStats {
            driver: Some(DriverKind::Redis),
            queues: stats,
        })
    }

    async fn declare_queue(&self, queue: &str) -> Result<(), QueueError> {
        self.remember(queue)
    }

    async fn delete_queue(&self, queue: &str) -> Result<(), QueueError> {
        let keys = self.keys(queue);
        let mut conn = self.connection.clone();
        let _: i64 = conn.del(vec![keys.ready, keys.delayed]).await?;
        self.forget(queue)
    }

    fn kind(&self) -> DriverKind {
        DriverKind::Redis
    }
}
