//! Wire encoding of messages stored in a backend.

use crate::error::SerializationError;
use crate::message::{Message, QueuedMessage};
use serde::{Deserialize, Serialize};

/// Converts messages to and from the raw representation stored by drivers
pub trait MessageSerializer: Send + Sync {
    /// Encode a message together with its current attempt count
    fn serialize(&self, message: &Message, attempts: u32) -> Result<String, SerializationError>;

    /// Decode a raw payload into the message and its attempt count
    fn deserialize(&self, raw: &str) -> Result<(Message, u32), SerializationError>;

    /// Decode a popped payload; undecodable payloads become error messages
    fn decode(&self, raw: String, queue: &str) -> QueuedMessage {
        match self.deserialize(&raw) {
            Ok((mut message, attempts)) => {
                message.queue = queue.to_string();
                QueuedMessage::new(message, attempts, raw)
            }
            Err(err) => {
                tracing::warn!(queue = %queue, error = %err, "Failed to decode queued payload");
                QueuedMessage::from_error(raw, queue, err)
            }
        }
    }
}

/// JSON encoding; the attempt count travels next to the message fields
#[derive(Debug, Clone, Copy, Default)]
pub struct JsonSerializer;

#[derive(Serialize)]
struct WireRef<'a> {
    #[serde(flatten)]
    message: &'a Message,
    attempts: u32,
}

#[derive(Deserialize)]
struct Wire {
    #[serde(flatten)]
    message: Message,
    #[serde(default = "first_attempt")]
    attempts: u32,
}

fn first_attempt() -> u32 {
    1
}

impl MessageSerializer for JsonSerializer {
    fn serialize(&self, message: &Message, attempts: u32) -> Result<String, SerializationError> {
        Ok(serde_json::to_string(&WireRef { message, attempts })?)
    }

    fn deserialize(&self, raw: &str) -> Result<(Message, u32), SerializationError> {
        let wire: Wire = serde_json::from_str(raw)?;
        Ok((wire.message, wire.attempts))
    }
}

#[cfg(test)]
#[path = "serializer_tests.rs"]
mod tests;
