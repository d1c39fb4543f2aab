//! Error types for queue operations and message processing.

use chrono::Duration;
use thiserror::Error;

/// Comprehensive error type for all driver and store operations
#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Queue not found: {queue_name}")]
    QueueNotFound { queue_name: String },

    #[error("Message not found or reservation expired: {receipt}")]
    MessageNotFound { receipt: String },

    #[error("Operation timed out after {duration:?}")]
    Timeout { duration: Duration },

    #[error("Connection failed: {message}")]
    ConnectionFailed { message: String },

    #[error("Provider error ({provider}): {code} - {message}")]
    ProviderError {
        provider: String,
        code: String,
        message: String,
    },

    #[error("Operation '{operation}' is not supported by the {driver} driver")]
    Unsupported { driver: String, operation: String },

    #[error("Serialization failed: {0}")]
    SerializationError(#[from] SerializationError),

    #[error("Configuration error: {0}")]
    ConfigurationError(#[from] ConfigurationError),

    #[error("Validation error: {0}")]
    ValidationError(#[from] ValidationError),
}

impl QueueError {
    /// Check if error is transient and should be retried
    pub fn is_transient(&self) -> bool {
        match self {
            Self::QueueNotFound { .. } => false,
            Self::MessageNotFound { .. } => false,
            Self::Timeout { .. } => true,
            Self::ConnectionFailed { .. } => true,
            Self::ProviderError { .. } => true, // Provider-specific errors are usually transient
            Self::Unsupported { .. } => false,
            Self::SerializationError(_) => false,
            Self::ConfigurationError(_) => false,
            Self::ValidationError(_) => false,
        }
    }

    /// Check if error should be retried
    pub fn should_retry(&self) -> bool {
        self.is_transient()
    }

    /// Get suggested retry delay
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Timeout { .. } => Some(Duration::seconds(1)),
            Self::ConnectionFailed { .. } => Some(Duration::seconds(5)),
            _ => None,
        }
    }

    pub(crate) fn unsupported(driver: &str, operation: &str) -> Self {
        Self::Unsupported {
            driver: driver.to_string(),
            operation: operation.to_string(),
        }
    }

    /// Error raised when a driver-internal lock has been poisoned by a panic
    pub(crate) fn poisoned(provider: &str) -> Self {
        Self::ProviderError {
            provider: provider.to_string(),
            code: "LockPoisoned".to_string(),
            message: "internal state lock poisoned".to_string(),
        }
    }
}

/// Errors during message serialization/deserialization
#[derive(Debug, Error)]
pub enum SerializationError {
    #[error("JSON serialization failed: {0}")]
    JsonError(#[from] serde_json::Error),

    #[error("Message body is not valid UTF-8")]
    InvalidUtf8,

    #[error("Message header '{key}' has invalid value")]
    InvalidHeader { key: String },
}

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigurationError {
    #[error("Invalid configuration: {message}")]
    Invalid { message: String },

    #[error("Missing required configuration: {key}")]
    Missing { key: String },

    #[error("Configuration parsing failed: {message}")]
    Parsing { message: String },

    #[error("Unknown middleware '{name}'")]
    UnknownMiddleware { name: String },

    #[error("Connection '{connection}' requires a {transport} transport to be registered")]
    MissingTransport {
        connection: String,
        transport: String,
    },
}

/// Validation errors
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("Required field missing: {field}")]
    Required { field: String },

    #[error("Invalid format for {field}: {message}")]
    InvalidFormat { field: String, message: String },

    #[error("Value out of range for {field}: {message}")]
    OutOfRange { field: String, message: String },
}

/// Outcome of a failed processing step in the receiver chain.
///
/// Policy receivers inspect this value instead of catching panics: the
/// no-failure receiver swallows everything except [`ProcessError::Fatal`].
#[derive(Debug, Error)]
pub enum ProcessError {
    /// Ordinary failure raised by application code
    #[error("Handler failed: {0:#}")]
    Handler(anyhow::Error),

    /// No handler could be resolved for the message
    #[error("No handler resolved for job '{job}' on queue '{queue}'")]
    Unresolved { job: String, queue: String },

    /// Backend failure while finalizing or re-sending a delivery
    #[error(transparent)]
    Queue(#[from] QueueError),

    /// Unrecoverable fault; never swallowed by any policy
    #[error("Fatal error: {0}")]
    Fatal(String),
}

impl ProcessError {
    /// Check if the error must stop the consumer regardless of installed policies
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }

    /// Check if the error originates from the backend and may resolve on reconnect
    pub fn is_transient(&self) -> bool {
        match self {
            Self::Queue(err) => err.is_transient(),
            _ => false,
        }
    }
}

impl From<anyhow::Error> for ProcessError {
    fn from(err: anyhow::Error) -> Self {
        Self::Handler(err)
    }
}

#[cfg(test)]
#[path = "error_tests.rs"]
mod tests;
