//! Shared fixtures for unit tests.

use crate::driver::{Connection, DriverKind, DriverStats, QueueDriver};
use crate::drivers::MemoryDriver;
use crate::consumer::StopHandle;
use crate::envelope::Envelope;
use crate::error::{ProcessError, QueueError};
use crate::message::{Message, QueuedMessage};
use crate::receiver::{Chain, Next, Pipeline, Receiver};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Driver call observed by [`RecordingDriver`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Push { queue: String, attempts: u32, delay: u64 },
    Acknowledge,
    Release { delay: u64 },
}

/// Memory driver that records every finalizing call
#[derive(Default)]
pub struct RecordingDriver {
    inner: MemoryDriver,
    calls: Mutex<Vec<Call>>,
}

impl RecordingDriver {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count_of(&self, call: &Call) -> usize {
        self.calls().iter().filter(|c| *c == call).count()
    }

    pub fn pushes(&self) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|c| matches!(c, Call::Push { .. }))
            .collect()
    }

    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }
}

#[async_trait]
impl QueueDriver for RecordingDriver {
    async fn push(&self, message: &Message, attempts: u32) -> Result<(), QueueError> {
        self.record(Call::Push {
            queue: message.queue.clone(),
            attempts,
            delay: message.delay,
        });
        self.inner.push(message, attempts).await
    }

    async fn push_raw(&self, raw: &str, queue: &str, delay: u64) -> Result<(), QueueError> {
        self.inner.push_raw(raw, queue, delay).await
    }

    async fn pop(
        &self,
        queue: &str,
        duration: Duration,
    ) -> Result<Option<QueuedMessage>, QueueError> {
        self.inner.pop(queue, duration).await
    }

    async fn acknowledge(&self, message: &QueuedMessage) -> Result<(), QueueError> {
        self.record(Call::Acknowledge);
        self.inner.acknowledge(message).await
    }

    async fn release(&self, message: &QueuedMessage) -> Result<(), QueueError> {
        self.record(Call::Release {
            delay: message.delay(),
        });
        self.inner.release(message).await
    }

    async fn count(&self, queue: &str) -> Result<Option<u64>, QueueError> {
        self.inner.count(queue).await
    }

    async fn stats(&self) -> Result<DriverStats, QueueError> {
        self.inner.stats().await
    }

    fn kind(&self) -> DriverKind {
        DriverKind::Memory
    }
}

/// Push `message` through `driver` and pop it back as an envelope
pub async fn deliver(driver: &Arc<RecordingDriver>, message: Message) -> Envelope {
    deliver_attempt(driver, message, 1).await
}

/// Like [`deliver`], with the delivery already at attempt `attempts`
pub async fn deliver_attempt(
    driver: &Arc<RecordingDriver>,
    message: Message,
    attempts: u32,
) -> Envelope {
    let connection = Connection::new("test", driver.clone());
    let queue = message.queue.clone();
    driver.inner.push(&message, attempts).await.unwrap();
    connection
        .pop(&queue, Duration::ZERO)
        .await
        .unwrap()
        .expect("pushed message should be available")
}

/// Outcome produced by [`ScriptedReceiver`] for one delivery
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Succeed,
    Fail,
    Fatal,
}

/// Terminal receiver replaying a script of outcomes.
///
/// Behaves like the processor: acknowledges on success, rejects without
/// requeue on failure. Succeeds once the script is exhausted.
#[derive(Default)]
pub struct ScriptedReceiver {
    script: Mutex<VecDeque<Outcome>>,
    pub received: AtomicUsize,
    pub timeouts: AtomicUsize,
    pub stops: AtomicUsize,
    pub starts: AtomicUsize,
    pub terminates: AtomicUsize,
}

impl ScriptedReceiver {
    pub fn new(script: impl IntoIterator<Item = Outcome>) -> Arc<Self> {
        Arc::new(Self {
            script: Mutex::new(script.into_iter().collect()),
            ..Self::default()
        })
    }

    pub fn succeeding() -> Arc<Self> {
        Self::new([])
    }

    pub fn received(&self) -> usize {
        self.received.load(Ordering::SeqCst)
    }

    pub fn count(counter: &AtomicUsize) -> usize {
        counter.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Receiver for ScriptedReceiver {
    async fn receive(&self, envelope: &mut Envelope, _next: &dyn Next) -> Result<(), ProcessError> {
        self.received.fetch_add(1, Ordering::SeqCst);
        let outcome = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or(Outcome::Succeed);

        match outcome {
            Outcome::Succeed => {
                envelope.acknowledge().await?;
                Ok(())
            }
            Outcome::Fail => {
                envelope.reject(false).await?;
                Err(ProcessError::Handler(anyhow::anyhow!("scripted failure")))
            }
            Outcome::Fatal => Err(ProcessError::Fatal("scripted fatal".to_string())),
        }
    }

    async fn receive_timeout(&self, _next: &dyn Next) -> Result<(), ProcessError> {
        self.timeouts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn receive_stop(&self, _next: &dyn Next) -> Result<(), ProcessError> {
        self.stops.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn start(&self, _next: &dyn Next) -> Result<(), ProcessError> {
        self.starts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn terminate(&self, _next: &dyn Next) -> Result<(), ProcessError> {
        self.terminates.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Run `envelope` through a pipeline of `receivers`
pub async fn run_chain(
    receivers: Vec<Arc<dyn Receiver>>,
    stop: &StopHandle,
    envelope: &mut Envelope,
) -> Result<(), ProcessError> {
    Pipeline::new(receivers).entry(stop).receive(envelope).await
}
