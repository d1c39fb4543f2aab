//! Failed job store.
//!
//! Messages that fail terminally are captured as [`FailedJob`] snapshots by
//! the store-on-failure receiver. Stores support lookup, criteria search,
//! purge and re-sending through [`retry_failed`].
//!
//! A retried job that fails again keeps its first failure time and increments
//! its failure count. Both travel with the re-sent message in the
//! [`FIRST_FAILED_AT_HEADER`] and [`FAILED_ATTEMPTS_HEADER`] headers.

use crate::driver::Connection;
use crate::error::QueueError;
use crate::message::{Message, MessageId, QueuedMessage, Timestamp};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;

pub mod criteria;
pub mod database;
pub mod memory;

pub use criteria::{CriteriaField, CriteriaValue, FailedJobCriteria, Filter, Operator};
pub use database::DatabaseFailedJobStore;
pub use memory::MemoryFailedJobStore;

#[cfg(test)]
#[path = "failer_tests.rs"]
mod tests;

/// Header carrying the epoch milliseconds of the first failure
pub const FIRST_FAILED_AT_HEADER: &str = "failer-first-failed-at";

/// Header carrying how many times the job has failed terminally
pub const FAILED_ATTEMPTS_HEADER: &str = "failer-attempts";

/// Snapshot of a terminally failed message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FailedJob {
    pub id: MessageId,
    pub name: String,
    pub connection: String,
    pub queue: String,
    pub message: Message,
    pub error: String,
    pub failed_at: Timestamp,
    pub first_failed_at: Timestamp,
    /// Number of terminal failures, counting this one
    pub attempts: u32,
}

impl FailedJob {
    /// Capture `message` failing with `error`
    pub fn create(message: &QueuedMessage, error: impl std::fmt::Display) -> Self {
        let now = Timestamp::now();
        let mut snapshot = message.message().clone();

        let first_failed_at = snapshot
            .header(FIRST_FAILED_AT_HEADER)
            .and_then(|value| value.parse::<i64>().ok())
            .map(Timestamp::from_millis)
            .unwrap_or(now);
        let attempts = snapshot
            .header(FAILED_ATTEMPTS_HEADER)
            .and_then(|value| value.parse::<u32>().ok())
            .map(|previous| previous.saturating_add(1))
            .unwrap_or(1);

        snapshot.headers.insert(
            FIRST_FAILED_AT_HEADER.to_string(),
            first_failed_at.as_millis().to_string(),
        );
        snapshot
            .headers
            .insert(FAILED_ATTEMPTS_HEADER.to_string(), attempts.to_string());
        snapshot.delay = 0;

        Self {
            id: MessageId::new(),
            name: snapshot.display_name().to_string(),
            connection: snapshot.connection.clone().unwrap_or_default(),
            queue: message.queue().to_string(),
            message: snapshot,
            error: error.to_string(),
            failed_at: now,
            first_failed_at,
            attempts,
        }
    }

    /// Message to send when retrying this job
    pub fn retry_message(&self) -> Message {
        let mut message = self.message.clone().on_queue(self.queue.clone());
        message.topic = None;
        message
    }
}

/// Persistence of failed jobs
#[async_trait]
pub trait FailedJobStore: Send + Sync {
    async fn store(&self, job: FailedJob) -> Result<(), QueueError>;

    /// Jobs matching `criteria`, oldest failure first
    async fn search(&self, criteria: &FailedJobCriteria) -> Result<Vec<FailedJob>, QueueError>;

    /// Delete jobs matching `criteria`; returns how many were removed
    async fn purge(&self, criteria: &FailedJobCriteria) -> Result<u64, QueueError>;

    async fn all(&self) -> Result<Vec<FailedJob>, QueueError> {
        self.search(&FailedJobCriteria::new()).await
    }

    async fn find(&self, id: &MessageId) -> Result<Option<FailedJob>, QueueError> {
        let criteria = FailedJobCriteria::new().id(id.as_str());
        Ok(self.search(&criteria).await?.into_iter().next())
    }

    /// Delete one job; returns whether it existed
    async fn forget(&self, id: &MessageId) -> Result<bool, QueueError> {
        let criteria = FailedJobCriteria::new().id(id.as_str());
        Ok(self.purge(&criteria).await? > 0)
    }

    /// Delete every job
    async fn flush(&self) -> Result<u64, QueueError> {
        self.purge(&FailedJobCriteria::new()).await
    }
}

/// Re-send the jobs matching `criteria` through `connection` and forget them.
///
/// Returns the number of jobs re-sent. A job is forgotten only after it was
/// sent, so a failure midway leaves the remaining jobs in the store.
pub async fn retry_failed(
    store: &dyn FailedJobStore,
    connection: &Connection,
    criteria: &FailedJobCriteria,
) -> Result<usize, QueueError> {
    let jobs = store.search(criteria).await?;
    let mut retried = 0;

    for job in jobs {
        connection.send(job.retry_message()).await?;
        store.forget(&job.id).await?;
        info!(
            id = %job.id,
            job = %job.name,
            queue = %job.queue,
            attempts = job.attempts,
            "Retried failed job"
        );
        retried += 1;
    }

    Ok(retried)
}
