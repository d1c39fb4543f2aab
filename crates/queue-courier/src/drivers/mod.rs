//! Queue driver implementations.
//!
//! This module contains one [`QueueDriver`](crate::driver::QueueDriver)
//! implementation per supported backend.

pub mod amqp;
pub mod database;
pub mod log;
pub mod memory;
pub mod redis;

pub use amqp::{AmqpChannel, AmqpDriver, AmqpOptions};
pub use database::{DatabaseDriver, DatabaseOptions};
pub use self::log::{CommitMode, LogClient, LogDriver, LogOptions};
pub use memory::MemoryDriver;
pub use self::redis::{RedisDriver, RedisOptions};
