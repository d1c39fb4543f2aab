//! Receiver interceptor chain.
//!
//! A [`Receiver`] wraps the rest of the chain, reachable through the [`Next`]
//! argument of every call. A receiver either forwards the call unchanged or
//! runs a policy around it. The chain always ends in a
//! [`ProcessorReceiver`], which never forwards.
//!
//! Two compositions are available behind the [`Chain`] trait:
//!
//! - [`Pipeline`]: an ordered list traversed by an immutable [`Cursor`].
//!   Advancing produces a new cursor over the remaining slice, so a receiver
//!   may call `next` several times (for synthesized messages) without
//!   disturbing any other traversal.
//! - [`Stack`]: nested decorators. The receiver pushed last becomes the
//!   outermost one and runs first.
//!
//! Order matters for the failure policies:
//!
//! ```text
//!   no_failure ─▶ store ─▶ retry ─▶ processor   store only final failures
//!   no_failure ─▶ retry ─▶ store ─▶ processor   store every failed attempt
//! ```
//!
//! The no-failure receiver must be outside the others or it hides failures
//! from them.

use crate::consumer::StopHandle;
use crate::envelope::Envelope;
use crate::error::ProcessError;
use async_trait::async_trait;
use std::sync::Arc;

pub mod bench;
pub mod builder;
pub mod limiter;
pub mod logger;
pub mod no_failure;
pub mod processor;
pub mod rate;
pub mod retry;
pub mod stop_when_empty;
pub mod store;

pub use bench::{BenchReceiver, BenchReport};
pub use builder::{Middleware, ReceiverBuilder};
pub use limiter::{
    MemoryLimiterReceiver, MemoryGauge, MessageCountLimiterReceiver, ProcessMemory,
    TimeLimiterReceiver,
};
pub use logger::MessageLoggerReceiver;
pub use no_failure::NoFailureReceiver;
pub use processor::ProcessorReceiver;
pub use rate::RateLimiterReceiver;
pub use retry::{RetryPolicy, RetryReceiver};
pub use stop_when_empty::StopWhenEmptyReceiver;
pub use store::StoreFailedReceiver;

#[cfg(test)]
#[path = "chain_tests.rs"]
mod tests;

// ============================================================================
// Contracts
// ============================================================================

/// One link of the chain.
///
/// Every method receives the rest of the chain as `next`. The default
/// implementations forward unchanged.
#[async_trait]
pub trait Receiver: Send + Sync {
    /// Handle one delivery
    async fn receive(&self, envelope: &mut Envelope, next: &dyn Next) -> Result<(), ProcessError> {
        next.receive(envelope).await
    }

    /// Called when a poll cycle produced no message
    async fn receive_timeout(&self, next: &dyn Next) -> Result<(), ProcessError> {
        next.receive_timeout().await
    }

    /// Called once when the consumer leaves its loop
    async fn receive_stop(&self, next: &dyn Next) -> Result<(), ProcessError> {
        next.receive_stop().await
    }

    /// Called once before the first poll
    async fn start(&self, next: &dyn Next) -> Result<(), ProcessError> {
        next.start().await
    }

    /// Called once when the consumer shuts down, after `receive_stop`
    async fn terminate(&self, next: &dyn Next) -> Result<(), ProcessError> {
        next.terminate().await
    }
}

/// The rest of the chain as seen from inside a receiver
#[async_trait]
pub trait Next: Send + Sync {
    async fn receive(&self, envelope: &mut Envelope) -> Result<(), ProcessError>;

    async fn receive_timeout(&self) -> Result<(), ProcessError>;

    async fn receive_stop(&self) -> Result<(), ProcessError>;

    async fn start(&self) -> Result<(), ProcessError>;

    async fn terminate(&self) -> Result<(), ProcessError>;

    /// Ask the consumer to leave its loop before the next poll
    fn stop(&self);
}

/// A composed chain that can be entered from its outermost receiver
pub trait Chain: Send + Sync {
    fn entry<'a>(&'a self, stop: &'a StopHandle) -> Box<dyn Next + 'a>;
}

// ============================================================================
// Pipeline
// ============================================================================

/// Receivers traversed in list order, first element outermost
#[derive(Clone, Default)]
pub struct Pipeline {
    receivers: Vec<Arc<dyn Receiver>>,
}

impl Pipeline {
    pub fn new(receivers: Vec<Arc<dyn Receiver>>) -> Self {
        Self { receivers }
    }

    pub fn len(&self) -> usize {
        self.receivers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.receivers.is_empty()
    }
}

impl Chain for Pipeline {
    fn entry<'a>(&'a self, stop: &'a StopHandle) -> Box<dyn Next + 'a> {
        Box::new(Cursor {
            receivers: &self.receivers,
            stop,
        })
    }
}

/// Position in a [`Pipeline`]: the receivers not visited yet
#[derive(Clone, Copy)]
pub struct Cursor<'a> {
    receivers: &'a [Arc<dyn Receiver>],
    stop: &'a StopHandle,
}

impl<'a> Cursor<'a> {
    pub fn new(receivers: &'a [Arc<dyn Receiver>], stop: &'a StopHandle) -> Self {
        Self { receivers, stop }
    }

    /// Current receiver and the cursor behind it
    fn advance(self) -> Option<(&'a Arc<dyn Receiver>, Cursor<'a>)> {
        let (head, rest) = self.receivers.split_first()?;
        Some((
            head,
            Cursor {
                receivers: rest,
                stop: self.stop,
            },
        ))
    }

    pub fn remaining(&self) -> usize {
        self.receivers.len()
    }
}

#[async_trait]
impl<'a> Next for Cursor<'a> {
    async fn receive(&self, envelope: &mut Envelope) -> Result<(), ProcessError> {
        match self.advance() {
            Some((receiver, rest)) => receiver.receive(envelope, &rest).await,
            None => Ok(()),
        }
    }

    async fn receive_timeout(&self) -> Result<(), ProcessError> {
        match self.advance() {
            Some((receiver, rest)) => receiver.receive_timeout(&rest).await,
            None => Ok(()),
        }
    }

    async fn receive_stop(&self) -> Result<(), ProcessError> {
        match self.advance() {
            Some((receiver, rest)) => receiver.receive_stop(&rest).await,
            None => Ok(()),
        }
    }

    async fn start(&self) -> Result<(), ProcessError> {
        match self.advance() {
            Some((receiver, rest)) => receiver.start(&rest).await,
            None => Ok(()),
        }
    }

    async fn terminate(&self) -> Result<(), ProcessError> {
        match self.advance() {
            Some((receiver, rest)) => receiver.terminate(&rest).await,
            None => Ok(()),
        }
    }

    fn stop(&self) {
        self.stop.stop();
    }
}

// ============================================================================
// Stack
// ============================================================================

struct Layer {
    receiver: Arc<dyn Receiver>,
    inner: Option<Arc<Layer>>,
}

/// Decorator composition: each pushed receiver wraps everything pushed before
#[derive(Clone, Default)]
pub struct Stack {
    outermost: Option<Arc<Layer>>,
}

impl Stack {
    pub fn new() -> Self {
        Self::default()
    }

    /// Wrap the current stack in `receiver`
    pub fn push(mut self, receiver: Arc<dyn Receiver>) -> Self {
        self.outermost = Some(Arc::new(Layer {
            receiver,
            inner: self.outermost.take(),
        }));
        self
    }

    pub fn depth(&self) -> usize {
        std::iter::successors(self.outermost.as_deref(), |layer| layer.inner.as_deref()).count()
    }
}

impl Chain for Stack {
    fn entry<'a>(&'a self, stop: &'a StopHandle) -> Box<dyn Next + 'a> {
        Box::new(Link {
            layer: self.outermost.as_deref(),
            stop,
        })
    }
}

#[derive(Clone, Copy)]
struct Link<'a> {
    layer: Option<&'a Layer>,
    stop: &'a StopHandle,
}

impl<'a> Link<'a> {
    fn advance(self) -> Option<(&'a Arc<dyn Receiver>, Link<'a>)> {
        let layer = self.layer?;
        Some((
            &layer.receiver,
            Link {
                layer: layer.inner.as_deref(),
                stop: self.stop,
            },
        ))
    }
}

#[async_trait]
impl<'a> Next for Link<'a> {
    async fn receive(&self, envelope: &mut Envelope) -> Result<(), ProcessError> {
        match self.advance() {
            Some((receiver, inner)) => receiver.receive(envelope, &inner).await,
            None => Ok(()),
        }
    }

    async fn receive_timeout(&self) -> Result<(), ProcessError> {
        match self.advance() {
            Some((receiver, inner)) => receiver.receive_timeout(&inner).await,
            None => Ok(()),
        }
    }

    async fn receive_stop(&self) -> Result<(), ProcessError> {
        match self.advance() {
            Some((receiver, inner)) => receiver.receive_stop(&inner).await,
            None => Ok(()),
        }
    }

    async fn start(&self) -> Result<(), ProcessError> {
        match self.advance() {
            Some((receiver, inner)) => receiver.start(&inner).await,
            None => Ok(()),
        }
    }

    async fn terminate(&self) -> Result<(), ProcessError> {
        match self.advance() {
            Some((receiver, inner)) => receiver.terminate(&inner).await,
            None => Ok(()),
        }
    }

    fn stop(&self) {
        self.stop.stop();
    }
}
