//! Message types for queue operations including core domain identifiers.

use crate::error::ValidationError;
use chrono::{DateTime, Duration, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use std::str::FromStr;

/// Header carrying the correlation id of an RPC request
pub const CORRELATION_ID_HEADER: &str = "correlationId";

/// Header carrying the queue a reply must be sent to
pub const REPLY_TO_HEADER: &str = "replyTo";

// ============================================================================
// Core Domain Identifiers
// ============================================================================

/// Unique identifier for messages within the queue system
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MessageId(String);

impl MessageId {
    /// Generate new random message ID
    pub fn new() -> Self {
        let id = uuid::Uuid::new_v4();
        Self(id.to_string())
    }

    /// Get message ID as string
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for MessageId {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Display for MessageId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for MessageId {
    type Err = ValidationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Err(ValidationError::Required {
                field: "message_id".to_string(),
            });
        }

        Ok(Self(s.to_string()))
    }
}

/// Timestamp wrapper for consistent time handling
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// Create timestamp for current time
    pub fn now() -> Self {
        Self(Utc::now())
    }

    /// Create timestamp from DateTime
    pub fn from_datetime(dt: DateTime<Utc>) -> Self {
        Self(dt)
    }

    /// Create timestamp from milliseconds since the Unix epoch.
    ///
    /// Values outside the representable range saturate to the earliest or
    /// latest supported instant.
    pub fn from_millis(millis: i64) -> Self {
        match Utc.timestamp_millis_opt(millis).single() {
            Some(dt) => Self(dt),
            None if millis < 0 => Self(DateTime::<Utc>::MIN_UTC),
            None => Self(DateTime::<Utc>::MAX_UTC),
        }
    }

    /// Get underlying DateTime
    pub fn as_datetime(&self) -> DateTime<Utc> {
        self.0
    }

    /// Milliseconds since the Unix epoch
    pub fn as_millis(&self) -> i64 {
        self.0.timestamp_millis()
    }

    /// Timestamp shifted forward by whole seconds, saturating at the latest
    /// supported instant
    pub fn add_seconds(&self, seconds: u64) -> Self {
        let shifted = i64::try_from(seconds)
            .ok()
            .and_then(Duration::try_seconds)
            .and_then(|delta| self.0.checked_add_signed(delta));
        Self(shifted.unwrap_or(DateTime::<Utc>::MAX_UTC))
    }
}

impl std::fmt::Display for Timestamp {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.format("%Y-%m-%d %H:%M:%S UTC"))
    }
}

impl FromStr for Timestamp {
    type Err = chrono::ParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let dt = s.parse::<DateTime<Utc>>()?;
        Ok(Self::from_datetime(dt))
    }
}

// ============================================================================
// Message Types
// ============================================================================

/// Intent object created by producers.
///
/// A message targets either a queue or, when `topic` is set, every consumer
/// group subscribed to that topic.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    pub id: MessageId,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default)]
    pub data: Value,
    #[serde(default)]
    pub queue: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub topic: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub connection: Option<String>,
    #[serde(default)]
    pub delay: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tries: Option<u32>,
    #[serde(default)]
    pub no_store: bool,
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub headers: HashMap<String, String>,
    pub created_at: Timestamp,
}

impl Message {
    /// Create new message carrying `data`
    pub fn new(data: impl Into<Value>) -> Self {
        Self {
            id: MessageId::new(),
            name: None,
            data: data.into(),
            queue: String::new(),
            topic: None,
            connection: None,
            delay: 0,
            max_tries: None,
            no_store: false,
            headers: HashMap::new(),
            created_at: Timestamp::now(),
        }
    }

    /// Create a message for the job identified by `name`
    pub fn job(name: impl Into<String>, data: impl Into<Value>) -> Self {
        Self::new(data).with_name(name)
    }

    /// Set the job name used to resolve a handler
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Target a queue
    pub fn on_queue(mut self, queue: impl Into<String>) -> Self {
        self.queue = queue.into();
        self
    }

    /// Target a topic instead of a queue
    pub fn on_topic(mut self, topic: impl Into<String>) -> Self {
        self.topic = Some(topic.into());
        self
    }

    /// Set the connection the message is sent through
    pub fn on_connection(mut self, connection: impl Into<String>) -> Self {
        self.connection = Some(connection.into());
        self
    }

    /// Delay visibility by `seconds`
    pub fn with_delay(mut self, seconds: u64) -> Self {
        self.delay = seconds;
        self
    }

    /// Override the retry receiver's default max tries (`0` disables retries)
    pub fn with_max_tries(mut self, max_tries: u32) -> Self {
        self.max_tries = Some(max_tries);
        self
    }

    /// Exclude the message from the failed job store
    pub fn disable_store(mut self) -> Self {
        self.no_store = true;
        self
    }

    /// Add message header
    pub fn with_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(key.into(), value.into());
        self
    }

    /// Get a header value
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }

    /// Job name, or `"unknown"` when the message is anonymous
    pub fn display_name(&self) -> &str {
        self.name.as_deref().unwrap_or("unknown")
    }
}

/// A message received from a driver together with its delivery metadata
#[derive(Debug, Clone)]
pub struct QueuedMessage {
    message: Message,
    attempts: u32,
    raw: String,
    handle: Option<ReceiptHandle>,
    error: Option<String>,
}

impl QueuedMessage {
    /// Wrap a decoded message
    pub fn new(message: Message, attempts: u32, raw: String) -> Self {
        Self {
            message,
            attempts: attempts.max(1),
            raw,
            handle: None,
            error: None,
        }
    }

    /// Build the terminal stand-in for a payload that could not be decoded.
    ///
    /// Retries are disabled and the message is never stored on failure.
    pub fn from_error(raw: String, queue: &str, error: impl std::fmt::Display) -> Self {
        let mut message = Message::new(Value::Null)
            .on_queue(queue)
            .with_max_tries(0)
            .disable_store();
        message.name = Some("error".to_string());

        Self {
            message,
            attempts: 1,
            raw,
            handle: None,
            error: Some(error.to_string()),
        }
    }

    /// Attach the driver handle needed to finalize this delivery
    pub fn with_handle(mut self, handle: ReceiptHandle) -> Self {
        self.handle = Some(handle);
        self
    }

    pub fn message(&self) -> &Message {
        &self.message
    }

    pub fn message_mut(&mut self) -> &mut Message {
        &mut self.message
    }

    pub fn into_message(self) -> Message {
        self.message
    }

    pub fn data(&self) -> &Value {
        &self.message.data
    }

    pub fn name(&self) -> Option<&str> {
        self.message.name.as_deref()
    }

    pub fn queue(&self) -> &str {
        &self.message.queue
    }

    pub fn delay(&self) -> u64 {
        self.message.delay
    }

    pub fn set_delay(&mut self, seconds: u64) {
        self.message.delay = seconds;
    }

    pub fn max_tries(&self) -> Option<u32> {
        self.message.max_tries
    }

    pub fn no_store(&self) -> bool {
        self.message.no_store
    }

    /// Current attempt number, starting at 1
    pub fn attempts(&self) -> u32 {
        self.attempts
    }

    pub(crate) fn increment_attempts(&mut self) {
        self.attempts = self.attempts.saturating_add(1);
    }

    /// Copy with the attempt counter reset, used when capturing failures
    pub fn reset_attempts(&self) -> Self {
        let mut copy = self.clone();
        copy.attempts = 1;
        copy
    }

    /// Serialized form as popped from the backend
    pub fn raw(&self) -> &str {
        &self.raw
    }

    pub fn handle(&self) -> Option<&ReceiptHandle> {
        self.handle.as_ref()
    }

    /// Decoding error when this is an error message
    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    pub fn is_error_message(&self) -> bool {
        self.error.is_some()
    }
}

/// Opaque driver-specific token identifying one delivery
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReceiptHandle {
    /// In-process reservation id
    Memory { id: MessageId },
    /// Reserved row id
    Database { id: String },
    /// List pops are final; nothing to finalize
    Redis,
    /// Broker delivery tag on the consuming channel
    Amqp { delivery_tag: u64 },
    /// Position of the record in its partition
    Log {
        topic: String,
        partition: i32,
        offset: i64,
    },
}

impl std::fmt::Display for ReceiptHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Memory { id } => write!(f, "memory:{}", id),
            Self::Database { id } => write!(f, "database:{}", id),
            Self::Redis => write!(f, "redis"),
            Self::Amqp { delivery_tag } => write!(f, "amqp:{}", delivery_tag),
            Self::Log {
                topic,
                partition,
                offset,
            } => write!(f, "log:{}/{}@{}", topic, partition, offset),
        }
    }
}

#[cfg(test)]
#[path = "message_tests.rs"]
mod tests;
