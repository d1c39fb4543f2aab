//! Common test utilities for queue-courier integration tests
//!
//! This module provides:
//! - Tracing setup honouring `RUST_LOG`
//! - Connections on the in-memory and SQLite drivers
//! - Handler registries that count their calls

use queue_courier::drivers::{DatabaseDriver, DatabaseOptions, MemoryDriver};
use queue_courier::{handler_fn, Connection, HandlerRegistry};
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// Install a test subscriber once; later calls are ignored
#[allow(dead_code)]
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

#[allow(dead_code)]
pub fn memory_connection() -> Connection {
    Connection::new("memory", Arc::new(MemoryDriver::new()))
}

/// SQLite connection on a file inside `dir`, shared by every pooled connection
#[allow(dead_code)]
pub async fn database_connection(dir: &Path, max_connections: u32) -> Connection {
    let url = format!("sqlite://{}?mode=rwc", dir.join("queue.db").display());
    let driver = DatabaseDriver::connect(
        &url,
        DatabaseOptions {
            max_connections,
            ..Default::default()
        },
    )
    .await
    .expect("database should open");
    Connection::new("database", Arc::new(driver))
}

/// Handlers for `ok` and `fail` jobs plus a shared call counter for `fail`
#[allow(dead_code)]
pub fn counting_handlers() -> (HandlerRegistry, Arc<AtomicUsize>) {
    let failures = Arc::new(AtomicUsize::new(0));
    let counter = failures.clone();

    let mut handlers = HandlerRegistry::new();
    handlers
        .register("ok", handler_fn(|_message| async { Ok(()) }))
        .register(
            "fail",
            handler_fn(move |_message| {
                counter.fetch_add(1, Ordering::SeqCst);
                async { Err(anyhow::anyhow!("handler failed")) }
            }),
        );
    (handlers, failures)
}
