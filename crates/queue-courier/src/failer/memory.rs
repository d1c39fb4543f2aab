//! In-process failed job store.

use super::{FailedJob, FailedJobCriteria, FailedJobStore};
use crate::error::QueueError;
use async_trait::async_trait;
use std::sync::Mutex;

#[cfg(test)]
#[path = "memory_tests.rs"]
mod tests;

/// Failed jobs kept in insertion order
#[derive(Debug, Default)]
pub struct MemoryFailedJobStore {
    jobs: Mutex<Vec<FailedJob>>,
}

impl MemoryFailedJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_jobs<T>(&self, f: impl FnOnce(&mut Vec<FailedJob>) -> T) -> Result<T, QueueError> {
        let mut jobs = self
            .jobs
            .lock()
            .map_err(|_| QueueError::poisoned("memory-failer"))?;
        Ok(f(&mut jobs))
    }
}

#[async_trait]
impl FailedJobStore for MemoryFailedJobStore {
    async fn store(&self, job: FailedJob) -> Result<(), QueueError> {
        self.with_jobs(|jobs| jobs.push(job))
    }

    async fn search(&self, criteria: &FailedJobCriteria) -> Result<Vec<FailedJob>, QueueError> {
        self.with_jobs(|jobs| {
            let mut found: Vec<FailedJob> = jobs
                .iter()
                .filter(|job| criteria.matches(job))
                .cloned()
                .collect();
            found.sort_by_key(|job| job.failed_at);
            found
        })
    }

    async fn purge(&self, criteria: &FailedJobCriteria) -> Result<u64, QueueError> {
        self.with_jobs(|jobs| {
            let before = jobs.len();
            jobs.retain(|job| !criteria.matches(job));
            (before - jobs.len()) as u64
        })
    }
}
