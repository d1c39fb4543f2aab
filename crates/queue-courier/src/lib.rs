//! # Queue Courier
//!
//! Backend-agnostic reliable message queue client. Messages are pushed to a
//! named queue or published to a topic through a [`Connection`], consumed
//! through a chain of receivers and settled exactly once through their
//! [`Envelope`].
//!
//! This library provides:
//! - Drivers for an in-memory queue, a SQL table, Redis lists, AMQP brokers
//!   and partitioned log brokers
//! - An envelope state machine guarding acknowledge, reject and release
//! - Receiver chains in two forms, a decorator [`Stack`] and a cursor based
//!   [`Pipeline`], with retry, failure storage, limiting and logging policies
//! - A failed job store with searchable criteria
//! - A worker loop and settings-driven wiring
//!
//! ## Module Organization
//!
//! - [`error`] - Error types for queue, configuration and processing failures
//! - [`message`] - Messages, identifiers and received deliveries
//! - [`driver`] - The driver contract and the connection facade
//! - [`drivers`] - Driver implementations
//! - [`envelope`] - Per-delivery settlement state
//! - [`receiver`] - Receiver chains and policy receivers
//! - [`failer`] - Failed job storage
//! - [`consumer`] / [`worker`] - Polling and the run loop
//! - [`config`] - Settings files and the connection factory

pub mod config;
pub mod consumer;
pub mod driver;
pub mod drivers;
pub mod envelope;
pub mod error;
pub mod failer;
pub mod handler;
pub mod message;
pub mod receiver;
pub mod serializer;
pub mod worker;

#[cfg(test)]
mod test_support;

// Re-export commonly used types at crate root for convenience
pub use config::{ConnectionFactory, QueueSettings};
pub use consumer::{QueueConsumer, StopHandle};
pub use driver::{subscription_queue, Connection, Destination, DriverKind, QueueDriver};
pub use envelope::{DeliveryState, Envelope};
pub use error::{ConfigurationError, ProcessError, QueueError, SerializationError, ValidationError};
pub use failer::{FailedJob, FailedJobCriteria, FailedJobStore};
pub use handler::{handler_fn, Handler, HandlerRegistry};
pub use message::{Message, MessageId, QueuedMessage, ReceiptHandle, Timestamp};
pub use receiver::{Chain, Pipeline, Receiver, ReceiverBuilder, RetryPolicy, Stack};
pub use serializer::{JsonSerializer, MessageSerializer};
pub use worker::{Worker, WorkerOptions};
