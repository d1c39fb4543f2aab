//! Application handlers and their resolution.
//!
//! The processor receiver looks a handler up in a [`HandlerRegistry`] in this
//! order:
//!
//! 1. by job name (`Message::name`)
//! 2. by the queue the message was popped from
//! 3. the static fallback handler
//!
//! # Examples
//!
//! ```rust
//! use queue_courier::handler::{handler_fn, HandlerRegistry};
//!
//! let mut registry = HandlerRegistry::new();
//! registry.register(
//!     "send-email",
//!     handler_fn(|message| async move {
//!         println!("sending {}", message.data());
//!         Ok(())
//!     }),
//! );
//! assert!(registry.contains("send-email"));
//! ```

use crate::envelope::Envelope;
use crate::message::QueuedMessage;
use async_trait::async_trait;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

#[cfg(test)]
#[path = "handler_tests.rs"]
mod tests;

/// Application code invoked for each delivery.
///
/// A handler may finalize the envelope itself (for example with
/// [`Envelope::reply`]); otherwise the processor acknowledges it on success
/// and rejects it on failure.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(&self, envelope: &mut Envelope) -> anyhow::Result<()>;
}

/// Handler backed by an async closure receiving a copy of the message
pub struct FnHandler<F> {
    f: F,
}

#[async_trait]
impl<F, Fut> Handler for FnHandler<F>
where
    F: Fn(QueuedMessage) -> Fut + Send + Sync,
    Fut: Future<Output = anyhow::Result<()>> + Send,
{
    async fn handle(&self, envelope: &mut Envelope) -> anyhow::Result<()> {
        (self.f)(envelope.message().clone()).await
    }
}

/// Wrap an async closure as a shareable handler
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn Handler>
where
    F: Fn(QueuedMessage) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<()>> + Send + 'static,
{
    Arc::new(FnHandler { f })
}

// ============================================================================
// HandlerRegistry
// ============================================================================

/// Handlers by job name and by queue, plus an optional fallback
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    jobs: HashMap<String, Arc<dyn Handler>>,
    queues: HashMap<String, Arc<dyn Handler>>,
    fallback: Option<Arc<dyn Handler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry that sends every message to `handler`
    pub fn single(handler: Arc<dyn Handler>) -> Self {
        let mut registry = Self::new();
        registry.fallback(handler);
        registry
    }

    /// Register the handler of a job name, replacing any previous one
    pub fn register(&mut self, job: impl Into<String>, handler: Arc<dyn Handler>) -> &mut Self {
        self.jobs.insert(job.into(), handler);
        self
    }

    /// Register the handler used for anonymous jobs popped from `queue`
    pub fn on_queue(&mut self, queue: impl Into<String>, handler: Arc<dyn Handler>) -> &mut Self {
        self.queues.insert(queue.into(), handler);
        self
    }

    pub fn fallback(&mut self, handler: Arc<dyn Handler>) -> &mut Self {
        self.fallback = Some(handler);
        self
    }

    pub fn contains(&self, job: &str) -> bool {
        self.jobs.contains_key(job)
    }

    /// Find the handler of a delivery
    pub fn resolve(&self, message: &QueuedMessage) -> Option<Arc<dyn Handler>> {
        message
            .name()
            .and_then(|name| self.jobs.get(name))
            .or_else(|| self.queues.get(message.queue()))
            .or(self.fallback.as_ref())
            .cloned()
    }
}
