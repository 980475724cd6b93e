//! Durable task queue.
//!
//! A single-writer, `SQLite`-backed queue of [`TaskRow`]s. The watcher and
//! rescanner are the producers; the worker is the sole consumer. All
//! operations are serialized through an internal mutex: the store is not a
//! multi-writer system, and this makes that discipline an invariant of the
//! type rather than an accident of `SQLite`'s own locking.

mod error;
mod task;

pub use error::{Result, StoreError};
pub use task::{TaskAction, TaskExtra, TaskRow, TaskStatus};

use chrono::{SecondsFormat, Utc};
use tokio::sync::Mutex;
use tracing::{info, instrument, warn};

use crate::db::Database;

/// Default cap on the exponential backoff delay (1 hour), per the
/// open question in the original design: `2^retry_count` grows without
/// bound, so a reimplementation should clamp it.
pub const DEFAULT_MAX_BACKOFF_SECS: i64 = 3600;

fn now_str() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Outcome of [`TaskStore::add`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    /// A new row was inserted with this id.
    Inserted(i64),
    /// An `UPLOAD` task for this `local_path` was already pending or
    /// scheduled for retry; nothing was inserted.
    Duplicate,
}

/// Durable task queue backed by `SQLite`.
#[derive(Debug, Clone)]
pub struct TaskStore {
    db: Database,
    max_backoff_secs: i64,
    // Guards every operation below: the store has exactly one producer
    // discipline (MKDIR/DELETE/RENAME/AUDIT from the watcher, UPLOAD from
    // the watcher or rescanner) and exactly one consumer (the worker), and
    // this mutex makes "one write in flight at a time" explicit.
    write_lock: std::sync::Arc<Mutex<()>>,
}

impl TaskStore {
    /// Creates a task store over an already-migrated [`Database`].
    #[must_use]
    pub fn new(db: Database) -> Self {
        Self::with_max_backoff(db, DEFAULT_MAX_BACKOFF_SECS)
    }

    /// Creates a task store with a custom backoff cap (seconds).
    #[must_use]
    pub fn with_max_backoff(db: Database, max_backoff_secs: i64) -> Self {
        Self {
            db,
            max_backoff_secs,
            write_lock: std::sync::Arc::new(Mutex::new(())),
        }
    }

    /// Inserts a new task.
    ///
    /// For `UPLOAD` actions, if a task for the same `local_path` is already
    /// `PENDING`, the insert is skipped and [`EnqueueOutcome::Duplicate`] is
    /// returned. A task currently scheduled for `RETRY` does not dedupe:
    /// once a task has failed and is waiting out its backoff, a fresh
    /// filesystem touch enqueues a new attempt rather than waiting on it.
    ///
    /// # Errors
    /// Returns [`StoreError`] if the payload fails to serialize or the
    /// underlying insert fails for a reason other than the dedup race
    /// (which is handled via the partial unique index and surfaced as
    /// `Duplicate` rather than an error).
    #[instrument(skip(self, extra), fields(action = %extra.action(), rel_path = %rel_path))]
    pub async fn add(
        &self,
        local_path: &str,
        rel_path: &str,
        extra: TaskExtra,
    ) -> Result<EnqueueOutcome> {
        let _guard = self.write_lock.lock().await;
        let action = extra.action();
        let extra_json = serde_json::to_string(&extra)?;
        let now = now_str();

        if action == TaskAction::Upload {
            let existing: Option<(i64,)> = sqlx::query_as(
                "SELECT id FROM tasks WHERE local_path = ? AND action = 'UPLOAD' AND status = 0 LIMIT 1",
            )
            .bind(local_path)
            .fetch_optional(self.db.pool())
            .await?;

            if existing.is_some() {
                return Ok(EnqueueOutcome::Duplicate);
            }
        }

        let result = sqlx::query(
            r"INSERT INTO tasks (action, local_path, rel_path, extra, status, created_at, next_retry_at, retry_count)
              VALUES (?, ?, ?, ?, 0, ?, ?, 0)",
        )
        .bind(action.as_str())
        .bind(local_path)
        .bind(rel_path)
        .bind(&extra_json)
        .bind(&now)
        .bind(&now)
        .execute(self.db.pool())
        .await?;

        let id = result.last_insert_rowid();
        info!(id, %action, rel_path, "task enqueued");
        Ok(EnqueueOutcome::Inserted(id))
    }

    /// Returns the single oldest eligible task, without mutating state.
    ///
    /// A task is eligible when `status` is `PENDING` or `RETRY` and
    /// `next_retry_at <= now`. Eligible tasks are returned in ascending
    /// `created_at` order.
    ///
    /// # Errors
    /// Returns [`StoreError`] if the query fails.
    #[instrument(skip(self))]
    pub async fn take_due(&self) -> Result<Option<TaskRow>> {
        let _guard = self.write_lock.lock().await;
        let now = now_str();
        let row: Option<TaskRow> = sqlx::query_as(
            r"SELECT * FROM tasks
              WHERE status IN (0, 2) AND next_retry_at <= ?
              ORDER BY created_at ASC
              LIMIT 1",
        )
        .bind(&now)
        .fetch_optional(self.db.pool())
        .await?;
        Ok(row)
    }

    /// Deletes the task, marking it done. Missing rows are logged, not an error.
    ///
    /// # Errors
    /// Returns [`StoreError`] if the delete itself fails.
    #[instrument(skip(self))]
    pub async fn complete(&self, id: i64) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let result = sqlx::query("DELETE FROM tasks WHERE id = ?")
            .bind(id)
            .execute(self.db.pool())
            .await?;
        if result.rows_affected() == 0 {
            warn!(id, "tried to complete a task that no longer exists");
        }
        Ok(())
    }

    /// Schedules the task for retry with exponential backoff.
    ///
    /// `wait = min(2^retry_count, max_backoff_secs)` seconds from now;
    /// `retry_count` is incremented and `status` set to `RETRY`. A task
    /// whose id no longer exists is a no-op.
    ///
    /// # Errors
    /// Returns [`StoreError`] if either query fails.
    #[instrument(skip(self))]
    pub async fn fail(&self, id: i64) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let row: Option<(i64,)> = sqlx::query_as("SELECT retry_count FROM tasks WHERE id = ?")
            .bind(id)
            .fetch_optional(self.db.pool())
            .await?;
        let Some((retry_count,)) = row else {
            return Ok(());
        };

        let wait_secs = 2i64
            .checked_pow(u32::try_from(retry_count).unwrap_or(u32::MAX))
            .unwrap_or(i64::MAX)
            .min(self.max_backoff_secs);
        let next_retry_at = (Utc::now() + chrono::Duration::seconds(wait_secs))
            .to_rfc3339_opts(SecondsFormat::Millis, true);

        sqlx::query(
            "UPDATE tasks SET status = 2, retry_count = retry_count + 1, next_retry_at = ? WHERE id = ?",
        )
        .bind(&next_retry_at)
        .bind(id)
        .execute(self.db.pool())
        .await?;

        warn!(id, wait_secs, "task failed, scheduled for retry");
        Ok(())
    }
}
