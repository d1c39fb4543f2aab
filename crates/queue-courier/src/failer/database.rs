//! Failed job store backed by a SQLite table.
//!
//! ```sql
//! CREATE TABLE failed_jobs (
//!     id              TEXT PRIMARY KEY,
//!     name            TEXT NOT NULL,
//!     connection      TEXT NOT NULL,
//!     queue           TEXT NOT NULL,
//!     payload         TEXT NOT NULL,
//!     error           TEXT NOT NULL,
//!     failed_at       INTEGER NOT NULL,
//!     first_failed_at INTEGER NOT NULL,
//!     attempts        INTEGER NOT NULL
//! );
//! ```
//!
//! `payload` is the JSON encoding of the captured message; timestamps are
//! epoch milliseconds.

use super::{CriteriaValue, FailedJob, FailedJobCriteria, FailedJobStore};
use crate::drivers::database::validate_table_name;
use crate::error::{QueueError, SerializationError};
use crate::message::{MessageId, Timestamp};
use async_trait::async_trait;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};
use sqlx::FromRow;
use std::str::FromStr;

#[cfg(test)]
#[path = "database_tests.rs"]
mod tests;

#[derive(Debug, FromRow)]
struct FailedJobRow {
    id: String,
    name: String,
    connection: String,
    queue: String,
    payload: String,
    error: String,
    failed_at: i64,
    first_failed_at: i64,
    attempts: i64,
}

impl FailedJobRow {
    fn into_job(self) -> Result<FailedJob, QueueError> {
        let message = serde_json::from_str(&self.payload).map_err(SerializationError::from)?;
        Ok(FailedJob {
            id: MessageId::from_str(&self.id)?,
            name: self.name,
            connection: self.connection,
            queue: self.queue,
            message,
            error: self.error,
            failed_at: Timestamp::from_millis(self.failed_at),
            first_failed_at: Timestamp::from_millis(self.first_failed_at),
            attempts: u32::try_from(self.attempts).unwrap_or(u32::MAX),
        })
    }
}

/// Failed jobs persisted in SQLite
#[derive(Clone)]
pub struct DatabaseFailedJobStore {
    pool: SqlitePool,
    table: String,
}

impl DatabaseFailedJobStore {
    /// Wrap an existing pool; call [`DatabaseFailedJobStore::create_schema`] before use
    pub fn new(pool: SqlitePool, table: impl Into<String>) -> Result<Self, QueueError> {
        let table = table.into();
        validate_table_name(&table)?;
        Ok(Self { pool, table })
    }

    /// Open a pool on `url` and create the schema
    pub async fn connect(url: &str, table: impl Into<String>) -> Result<Self, QueueError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect(url)
            .await?;
        let store = Self::new(pool, table)?;
        store.create_schema().await?;
        Ok(store)
    }

    pub async fn create_schema(&self) -> Result<(), QueueError> {
        let table = &self.table;
        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                connection TEXT NOT NULL,
                queue TEXT NOT NULL,
                payload TEXT NOT NULL,
                error TEXT NOT NULL,
                failed_at INTEGER NOT NULL,
                first_failed_at INTEGER NOT NULL,
                attempts INTEGER NOT NULL
            )"
        ))
        .execute(&self.pool)
        .await?;

        Ok(())
    }
}

#[async_trait]
impl FailedJobStore for DatabaseFailedJobStore {
    async fn store(&self, job: FailedJob) -> Result<(), QueueError> {
        let payload = serde_json::to_string(&job.message).map_err(SerializationError::from)?;
        sqlx::query(&format!(
            "INSERT INTO {} (id, name, connection, queue, payload, error, failed_at, first_failed_at, attempts)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
            self.table
        ))
        .bind(job.id.as_str())
        .bind(&job.name)
        .bind(&job.connection)
        .bind(&job.queue)
        .bind(payload)
        .bind(&job.error)
        .bind(job.failed_at.as_millis())
        .bind(job.first_failed_at.as_millis())
        .bind(i64::from(job.attempts))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn search(&self, criteria: &FailedJobCriteria) -> Result<Vec<FailedJob>, QueueError> {
        let (fragment, binds) = criteria.to_sql();
        let sql = format!(
            "SELECT id, name, connection, queue, payload, error, failed_at, first_failed_at, attempts
             FROM {} WHERE {} ORDER BY failed_at, rowid",
            self.table, fragment
        );

        let mut query = sqlx::query_as::<_, FailedJobRow>(&sql);
        for value in binds {
            query = match value {
                CriteriaValue::Text(text) => query.bind(text),
                CriteriaValue::Time(time) => query.bind(time.as_millis()),
                CriteriaValue::Number(number) => query.bind(number),
            };
        }

        let rows = query.fetch_all(&self.pool).await?;

        rows.into_iter().map(FailedJobRow::into_job).collect()
    }

    async fn purge(&self, criteria: &FailedJobCriteria) -> Result<u64, QueueError> {
        let (fragment, binds) = criteria.to_sql();
        let sql = format!("DELETE FROM {} WHERE {}", self.table, fragment);

        let mut query = sqlx::query(&sql);
        for value in binds {
            query = match value {
                CriteriaValue::Text(text) => query.bind(text),
                CriteriaValue::Time(time) => query.bind(time.as_millis()),
                CriteriaValue::Number(number) => query.bind(number),
            };
        }

        Ok(query.execute(&self.pool).await?.rows_affected())
    }
}
