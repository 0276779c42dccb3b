//! Queue store abstraction and its PostgreSQL implementation.
//!
//! Every state transition of a task goes through a [`TaskStore`]. All writes
//! made on behalf of a worker are fenced on `status = running AND locked_by =
//! worker`, so a worker whose row was reclaimed cannot overwrite it.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::Value;
use sqlx::PgPool;
use tracing::info;
use uuid::Uuid;

use super::task::{Task, TaskError, TaskStatus};
use crate::error::Result;

/// How a claimed attempt ended, as decided by the worker.
#[derive(Debug, Clone, PartialEq)]
pub enum Outcome {
    /// Handler returned a value
    Success(Value),
    /// Handler failed with attempts left; eligible again after `delay`
    Retry { delay: Duration },
    /// Terminal failure
    Failure(TaskError),
}

/// Rows touched by one reaper pass.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReapReport {
    /// Returned to pending
    pub requeued: Vec<Uuid>,
    /// Lost their last attempt, now FAILURE
    pub failed: Vec<Uuid>,
}

impl ReapReport {
    pub fn is_empty(&self) -> bool {
        self.requeued.is_empty() && self.failed.is_empty()
    }
}

/// Snapshot of the queue for monitoring.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub pending: i64,
    pub running: i64,
    pub success: i64,
    pub failure: i64,
    pub cancelled: i64,
    /// Pending rows claimable right now
    pub eligible: i64,
    pub oldest_eligible_at: Option<DateTime<Utc>>,
}

impl QueueStats {
    pub fn add(&mut self, status: TaskStatus, count: i64) {
        match status {
            TaskStatus::Pending => self.pending += count,
            TaskStatus::Running => self.running += count,
            TaskStatus::Success => self.success += count,
            TaskStatus::Failure => self.failure += count,
            TaskStatus::Cancelled => self.cancelled += count,
        }
    }

    pub fn count(&self, status: TaskStatus) -> i64 {
        match status {
            TaskStatus::Pending => self.pending,
            TaskStatus::Running => self.running,
            TaskStatus::Success => self.success,
            TaskStatus::Failure => self.failure,
            TaskStatus::Cancelled => self.cancelled,
        }
    }

    /// Queue depth: everything not yet finished.
    pub fn depth(&self) -> i64 {
        self.pending + self.running
    }

    pub fn terminal(&self) -> i64 {
        self.success + self.failure + self.cancelled
    }

    pub fn total(&self) -> i64 {
        self.depth() + self.terminal()
    }
}

/// Trait for task queue storage.
///
/// Implementations must make `claim` atomic under concurrent callers: a row
/// is handed to at most one worker per attempt.
#[async_trait]
pub trait TaskStore: Send + Sync {
    /// Insert a new pending task. Returns `None` if the id already exists.
    ///
    /// The row becomes eligible at `not_before`, or at the store's own
    /// current time when `None`. `task.not_before` is not consulted.
    async fn insert(&self, task: &Task, not_before: Option<DateTime<Utc>>)
        -> Result<Option<Task>>;

    /// Point read.
    async fn get(&self, id: Uuid) -> Result<Option<Task>>;

    /// Claim the next eligible task for `worker_id`, skipping `skip_names`.
    async fn claim(&self, worker_id: &str, skip_names: &[String]) -> Result<Option<Task>>;

    /// Record the outcome of a claimed attempt.
    ///
    /// Returns false if `worker_id` no longer holds the row.
    async fn record_outcome(&self, id: Uuid, worker_id: &str, outcome: Outcome) -> Result<bool>;

    /// Return a claimed row to pending without counting the attempt.
    async fn release(&self, id: Uuid, worker_id: &str) -> Result<bool>;

    /// Refresh the lock timestamp of a running row.
    async fn heartbeat(&self, id: Uuid, worker_id: &str) -> Result<bool>;

    /// Cancel a pending task. False if it is running, terminal or missing.
    async fn cancel(&self, id: Uuid) -> Result<bool>;

    /// Reclaim running rows whose lock is older than `stale_after`.
    async fn reap_stale(&self, stale_after: Duration) -> Result<ReapReport>;

    /// Per-status counts for monitoring.
    async fn stats(&self) -> Result<QueueStats>;
}

/// PostgreSQL-backed task store.
#[derive(Clone)]
pub struct PostgresTaskStore {
    db: PgPool,
}

impl PostgresTaskStore {
    pub fn new(db: PgPool) -> Self {
        Self { db }
    }

    pub fn pool(&self) -> &PgPool {
        &self.db
    }

    /// Apply the bundled schema migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations").run(&self.db).await?;
        info!("task queue schema up to date");
        Ok(())
    }
}

#[async_trait]
impl TaskStore for PostgresTaskStore {
    async fn insert(
        &self,
        task: &Task,
        not_before: Option<DateTime<Utc>>,
    ) -> Result<Option<Task>> {
        task.insert(not_before, &self.db).await
    }

    async fn get(&self, id: Uuid) -> Result<Option<Task>> {
        Task::find_by_id(id, &self.db).await
    }

    async fn claim(&self, worker_id: &str, skip_names: &[String]) -> Result<Option<Task>> {
        Task::claim_next(worker_id, skip_names, &self.db).await
    }

    async fn record_outcome(&self, id: Uuid, worker_id: &str, outcome: Outcome) -> Result<bool> {
        match outcome {
            Outcome::Success(value) => Task::mark_succeeded(id, worker_id, &value, &self.db).await,
            Outcome::Retry { delay } => Task::schedule_retry(id, worker_id, delay, &self.db).await,
            Outcome::Failure(error) => Task::mark_failed(id, worker_id, &error, &self.db).await,
        }
    }

    async fn release(&self, id: Uuid, worker_id: &str) -> Result<bool> {
        Task::release(id, worker_id, &self.db).await
    }

    async fn heartbeat(&self, id: Uuid, worker_id: &str) -> Result<bool> {
        Task::heartbeat(id, worker_id, &self.db).await
    }

    async fn cancel(&self, id: Uuid) -> Result<bool> {
        Task::cancel(id, &self.db).await
    }

    async fn reap_stale(&self, stale_after: Duration) -> Result<ReapReport> {
        Task::reap_stale(stale_after, &self.db).await
    }

    async fn stats(&self) -> Result<QueueStats> {
        Task::stats(&self.db).await
    }
}
