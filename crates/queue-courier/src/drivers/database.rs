//! Relational queue driver backed by SQLite through `sqlx`.
//!
//! ## Table layout
//!
//! ```sql
//! CREATE TABLE jobs (
//!     id           TEXT PRIMARY KEY,
//!     queue        TEXT NOT NULL,
//!     raw          TEXT NOT NULL,
//!     reserved     INTEGER NOT NULL DEFAULT 0,
//!     reserved_at  INTEGER,
//!     available_at INTEGER NOT NULL,
//!     created_at   INTEGER NOT NULL
//! );
//! CREATE INDEX jobs_queue_reserved ON jobs (queue, reserved);
//! ```
//!
//! Timestamps are milliseconds since the Unix epoch.
//!
//! ## Reservation
//!
//! `reserve` opens the transaction with `BEGIN IMMEDIATE`, which takes the
//! database write lock before the eligibility read. Selected rows are marked
//! reserved with an update guarded by `reserved = 0` before `COMMIT` releases
//! the lock, so two reservers never receive the same row. Messages are decoded
//! only after the commit.

use crate::driver::{DriverKind, DriverStats, QueueDriver, QueueStats};
use crate::error::{ConfigurationError, QueueError};
use crate::message::{Message, MessageId, QueuedMessage, ReceiptHandle, Timestamp};
use crate::serializer::{JsonSerializer, MessageSerializer};
use async_trait::async_trait;
use serde::Deserialize;
use sqlx::sqlite::{SqliteConnection, SqlitePool, SqlitePoolOptions};
use sqlx::FromRow;
use std::sync::Arc;
use std::time::Duration;
use tracing::debug;

#[cfg(test)]
#[path = "database_tests.rs"]
mod tests;

/// Options of the database driver
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct DatabaseOptions {
    /// Name of the jobs table
    pub table: String,
    /// Reservations older than this many seconds become eligible again
    pub reservation_timeout: Option<u64>,
    /// Maximum pool size used by [`DatabaseDriver::connect`]
    pub max_connections: u32,
}

impl Default for DatabaseOptions {
    fn default() -> Self {
        Self {
            table: "jobs".to_string(),
            reservation_timeout: None,
            max_connections: 5,
        }
    }
}

impl From<sqlx::Error> for QueueError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Io(io) => QueueError::ConnectionFailed {
                message: io.to_string(),
            },
            sqlx::Error::PoolTimedOut => QueueError::Timeout {
                duration: chrono::Duration::seconds(30),
            },
            sqlx::Error::PoolClosed => QueueError::ConnectionFailed {
                message: "connection pool closed".to_string(),
            },
            sqlx::Error::RowNotFound => QueueError::MessageNotFound {
                receipt: "row not found".to_string(),
            },
            other => QueueError::ProviderError {
                provider: DriverKind::Database.as_str().to_string(),
                code: "Sqlx".to_string(),
                message: other.to_string(),
            },
        }
    }
}

/// Validate a SQL identifier interpolated into statements
pub(crate) fn validate_table_name(table: &str) -> Result<(), ConfigurationError> {
    let valid = !table.is_empty()
        && !table.starts_with(|c: char| c.is_ascii_digit())
        && table.chars().all(|c| c.is_ascii_alphanumeric() || c == '_');

    if valid {
        Ok(())
    } else {
        Err(ConfigurationError::Invalid {
            message: format!("'{}' is not a valid table name", table),
        })
    }
}

/// Rows reserved before this instant (epoch millis) are considered abandoned
fn stale_before(now: i64, reservation_timeout: Option<u64>) -> i64 {
    match reservation_timeout {
        Some(timeout) => {
            let millis = i64::try_from(timeout).unwrap_or(i64::MAX).saturating_mul(1000);
            now.saturating_sub(millis)
        }
        None => i64::MIN,
    }
}

#[derive(Debug, FromRow)]
struct JobRow {
    id: String,
    raw: String,
}

#[derive(Debug, FromRow)]
struct QueueCountRow {
    queue: String,
    total: i64,
    reserved: i64,
    delayed: i64,
}

/// Queue driver storing jobs as rows of a SQLite table
#[derive(Clone)]
pub struct DatabaseDriver {
    pool: SqlitePool,
    options: DatabaseOptions,
    serializer: Arc<dyn MessageSerializer>,
}

impl DatabaseDriver {
    /// Wrap an existing pool; call [`DatabaseDriver::create_schema`] before use
    pub fn new(pool: SqlitePool, options: DatabaseOptions) -> Result<Self, QueueError> {
        validate_table_name(&options.table)?;
        Ok(Self {
            pool,
            options,
            serializer: Arc::new(JsonSerializer),
        })
    }

    /// Open a pool on `url` and create the schema
    pub async fn connect(url: &str, options: DatabaseOptions) -> Result<Self, QueueError> {
        let pool = SqlitePoolOptions::new()
            .max_connections(options.max_connections.max(1))
            .connect(url)
            .await?;
        let driver = Self::new(pool, options)?;
        driver.create_schema().await?;
        Ok(driver)
    }

    pub fn with_serializer(mut self, serializer: Arc<dyn MessageSerializer>) -> Self {
        self.serializer = serializer;
        self
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Create the jobs table and its index if missing
    pub async fn create_schema(&self) -> Result<(), QueueError> {
        let table = &self.options.table;
        sqlx::query(&format!(
            "CREATE TABLE IF NOT EXISTS {table} (
                id TEXT PRIMARY KEY,
                queue TEXT NOT NULL,
                raw TEXT NOT NULL,
                reserved INTEGER NOT NULL DEFAULT 0,
                reserved_at INTEGER,
                available_at INTEGER NOT NULL,
                created_at INTEGER NOT NULL
            )"
        ))
        .execute(&self.pool)
        .await?;

        sqlx::query(&format!(
            "CREATE INDEX IF NOT EXISTS {table}_queue_reserved ON {table} (queue, reserved)"
        ))
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    /// Claim up to `count` eligible rows inside one locking transaction.
    ///
    /// The transaction rolls back when it is dropped uncommitted, so a failed
    /// claim or a cancelled caller never leaves the write lock held.
    async fn reserve_rows(&self, count: usize, queue: &str) -> Result<Vec<JobRow>, QueueError> {
        let mut tx = self.pool.begin_with("BEGIN IMMEDIATE").await?;
        let rows = self.claim(&mut tx, count, queue).await?;
        tx.commit().await?;
        Ok(rows)
    }

    async fn claim(
        &self,
        conn: &mut SqliteConnection,
        count: usize,
        queue: &str,
    ) -> Result<Vec<JobRow>, QueueError> {
        let table = &self.options.table;
        let now = Timestamp::now().as_millis();
        let stale_before = stale_before(now, self.options.reservation_timeout);

        let candidates: Vec<JobRow> = sqlx::query_as(&format!(
            "SELECT id, raw FROM {table}
             WHERE queue = ?
               AND ((reserved = 0 AND available_at <= ?) OR (reserved = 1 AND reserved_at < ?))
             ORDER BY available_at, created_at
             LIMIT ?"
        ))
        .bind(queue)
        .bind(now)
        .bind(stale_before)
        .bind(count as i64)
        .fetch_all(&mut *conn)
        .await?;

        let mut claimed = Vec::with_capacity(candidates.len());
        for row in candidates {
            let result = sqlx::query(&format!(
                "UPDATE {table} SET reserved = 1, reserved_at = ?
                 WHERE id = ? AND (reserved = 0 OR reserved_at < ?)"
            ))
            .bind(now)
            .bind(&row.id)
            .bind(stale_before)
            .execute(&mut *conn)
            .await?;

            if result.rows_affected() == 1 {
                claimed.push(row);
            }
        }

        Ok(claimed)
    }

    fn row_id(message: &QueuedMessage) -> Result<&str, QueueError> {
        match message.handle() {
            Some(ReceiptHandle::Database { id }) => Ok(id),
            other => Err(QueueError::MessageNotFound {
                receipt: other.map(ToString::to_string).unwrap_or_default(),
            }),
        }
    }
}

#[async_trait]
impl QueueDriver for DatabaseDriver {
    async fn push(&self, message: &Message, attempts: u32) -> Result<(), QueueError> {
        let raw = self.serializer.serialize(message, attempts)?;
        self.push_raw(&raw, &message.queue, message.delay).await
    }

    async fn push_raw(&self, raw: &str, queue: &str, delay: u64) -> Result<(), QueueError> {
        let now = Timestamp::now();
        sqlx::query(&format!(
            "INSERT INTO {} (id, queue, raw, reserved, reserved_at, available_at, created_at)
             VALUES (?, ?, ?, 0, NULL, ?, ?)",
            self.options.table
        ))
        .bind(MessageId::new().as_str())
        .bind(queue)
        .bind(raw)
        .bind(now.add_seconds(delay).as_millis())
        .bind(now.as_millis())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn pop(
        &self,
        queue: &str,
        duration: Duration,
    ) -> Result<Option<QueuedMessage>, QueueError> {
        Ok(self.reserve(1, queue, duration).await?.into_iter().next())
    }

    /// Claims rows once; when nothing is eligible it sleeps for `duration`
    /// instead of polling in a tight loop.
    async fn reserve(
        &self,
        count: usize,
        queue: &str,
        duration: Duration,
    ) -> Result<Vec<QueuedMessage>, QueueError> {
        if count == 0 {
            return Ok(Vec::new());
        }

        let rows = self.reserve_rows(count, queue).await?;
        if rows.is_empty() {
            debug!(queue = %queue, "No eligible rows; sleeping for poll duration");
            tokio::time::sleep(duration).await;
            return Ok(Vec::new());
        }

        Ok(rows
            .into_iter()
            .map(|row| {
                self.serializer
                    .decode(row.raw, queue)
                    .with_handle(ReceiptHandle::Database { id: row.id })
            })
            .collect())
    }

    async fn acknowledge(&self, message: &QueuedMessage) -> Result<(), QueueError> {
        let id = Self::row_id(message)?;
        sqlx::query(&format!("DELETE FROM {} WHERE id = ?", self.options.table))
            .bind(id)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn release(&self, message: &QueuedMessage) -> Result<(), QueueError> {
        let id = Self::row_id(message)?;
        let available_at = Timestamp::now().add_seconds(message.delay()).as_millis();
        let result = sqlx::query(&format!(
            "UPDATE {} SET reserved = 0, reserved_at = NULL, available_at = ? WHERE id = ?",
            self.options.table
        ))
        .bind(available_at)
        .bind(id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(QueueError::MessageNotFound {
                receipt: id.to_string(),
            });
        }
        Ok(())
    }

    async fn count(&self, queue: &str) -> Result<Option<u64>, QueueError> {
        let total: i64 = sqlx::query_scalar(&format!(
            "SELECT COUNT(*) FROM {} WHERE queue = ?",
            self.options.table
        ))
        .bind(queue)
        .fetch_one(&self.pool)
        .await?;
        Ok(Some(total.max(0) as u64))
    }

    async fn stats(&self) -> Result<DriverStats, QueueError> {
        let now = Timestamp::now().as_millis();
        let rows: Vec<QueueCountRow> = sqlx::query_as(&format!(
            "SELECT queue,
                    COUNT(*) AS total,
                    COALESCE(SUM(reserved), 0) AS reserved,
                    COALESCE(SUM(CASE WHEN reserved = 0 AND available_at > ? THEN 1 ELSE 0 END), 0) AS delayed
             FROM {}
             GROUP BY queue
             ORDER BY queue",
            self.options.table
        ))
        .bind(now)
        .fetch_all(&self.pool)
        .await?;

        let queues = rows
            .into_iter()
            .map(|row| QueueStats {
                queue: row.queue,
                ready: (row.total - row.reserved - row.delayed).max(0) as u64,
                reserved: Some(row.reserved.max(0) as u64),
                delayed: Some(row.delayed.max(0) as u64),
            })
            .collect();

        Ok(DriverStats {
            driver: Some(DriverKind::Database),
            queues,
        })
    }

    async fn declare_queue(&self, _queue: &str) -> Result<(), QueueError> {
        self.create_schema().await
    }

    async fn delete_queue(&self, queue: &str) -> Result<(), QueueError> {
        sqlx::query(&format!("DELETE FROM {} WHERE queue = ?", self.options.table))
            .bind(queue)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    fn kind(&self) -> DriverKind {
        DriverKind::Database
    }
}
