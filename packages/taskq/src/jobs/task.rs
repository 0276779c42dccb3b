//! Task model: the single persisted row every component coordinates through.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{FromRow, PgPool};
use thiserror::Error;
use typed_builder::TypedBuilder;
use uuid::Uuid;

use super::retry::MAX_RETRY_DELAY;
use super::store::{QueueStats, ReapReport};
use crate::error::{QueueError, Result};

// ============================================================================
// Enums
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type, Default)]
#[sqlx(type_name = "task_status", rename_all = "snake_case")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskStatus {
    #[default]
    Pending,
    Running,
    Success,
    Failure,
    Cancelled,
}

impl TaskStatus {
    pub const ALL: [TaskStatus; 5] = [
        TaskStatus::Pending,
        TaskStatus::Running,
        TaskStatus::Success,
        TaskStatus::Failure,
        TaskStatus::Cancelled,
    ];

    /// SUCCESS, FAILURE and CANCELLED never transition again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Success | TaskStatus::Failure | TaskStatus::Cancelled
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "PENDING",
            TaskStatus::Running => "RUNNING",
            TaskStatus::Success => "SUCCESS",
            TaskStatus::Failure => "FAILURE",
            TaskStatus::Cancelled => "CANCELLED",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for TaskStatus {
    type Err = QueueError;

    fn from_str(s: &str) -> Result<Self> {
        TaskStatus::ALL
            .into_iter()
            .find(|status| status.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| QueueError::Validation(format!("unknown task status: {s}")))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Handler returned an error - will retry if attempts remain
    #[default]
    Retryable,
    /// Handler rejected the task - terminal on first occurrence
    NonRetryable,
    /// Handler panicked - treated like a returned error
    Panicked,
    /// Worker stopped heartbeating while holding the row (set by the reaper)
    WorkerLost,
}

impl ErrorKind {
    /// Whether this error kind should trigger a retry
    pub fn should_retry(&self) -> bool {
        matches!(self, ErrorKind::Retryable | ErrorKind::Panicked)
    }

    /// Classify a handler error. Anything carrying [`NonRetryable`] is terminal.
    pub fn classify(error: &anyhow::Error) -> Self {
        let rejected = error.downcast_ref::<NonRetryable>().is_some()
            || error.chain().any(|cause| cause.is::<NonRetryable>());

        if rejected {
            ErrorKind::NonRetryable
        } else {
            ErrorKind::Retryable
        }
    }
}

/// Marker error a handler returns to fail without consuming retries.
///
/// ```ignore
/// registry.register("parse_page", RetryPolicy::default(), |task| async move {
///     let url: String = task.arg(0)?;
///     if url.is_empty() {
///         return Err(NonRetryable::error("empty url"));
///     }
///     Ok(url.len())
/// })?;
/// ```
#[derive(Debug, Error)]
#[error("{0}")]
pub struct NonRetryable(pub String);

impl NonRetryable {
    pub fn error(message: impl Into<String>) -> anyhow::Error {
        anyhow::Error::new(NonRetryable(message.into()))
    }
}

// ============================================================================
// Recorded failure
// ============================================================================

/// Failure details persisted in the `error` column of a FAILURE row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskError {
    pub kind: ErrorKind,
    pub message: String,
    /// Underlying causes, outermost first (excludes `message`)
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub chain: Vec<String>,
    #[serde(default)]
    pub attempt: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub worker: Option<String>,
}

impl TaskError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            chain: Vec::new(),
            attempt: 0,
            worker: None,
        }
    }

    /// Capture an error returned by a handler.
    pub fn from_handler(error: &anyhow::Error, attempt: i32, worker: &str) -> Self {
        Self {
            kind: ErrorKind::classify(error),
            message: error.to_string(),
            chain: error.chain().skip(1).map(|cause| cause.to_string()).collect(),
            attempt,
            worker: Some(worker.to_string()),
        }
    }

    pub fn panicked(message: impl Into<String>, attempt: i32, worker: &str) -> Self {
        Self {
            kind: ErrorKind::Panicked,
            message: message.into(),
            chain: Vec::new(),
            attempt,
            worker: Some(worker.to_string()),
        }
    }
}

impl fmt::Display for TaskError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}: {}", self.kind, self.message)
    }
}

// ============================================================================
// Task Model
// ============================================================================

/// Whether any string or object key in `value` holds a NUL character, which
/// Postgres `jsonb` cannot store.
pub fn contains_nul(value: &Value) -> bool {
    match value {
        Value::String(text) => text.contains('\0'),
        Value::Array(items) => items.iter().any(contains_nul),
        Value::Object(map) => map
            .iter()
            .any(|(key, item)| key.contains('\0') || contains_nul(item)),
        Value::Null | Value::Bool(_) | Value::Number(_) => false,
    }
}

/// Generate a task id. UUID v7 keeps `id ASC` close to insertion order.
pub fn task_id() -> Uuid {
    Uuid::now_v7()
}

#[derive(FromRow, Debug, Clone, PartialEq, Serialize, Deserialize, TypedBuilder)]
#[builder(field_defaults(setter(into)))]
pub struct Task {
    #[builder(default = task_id())]
    pub id: Uuid,
    pub name: String,

    // Payload
    #[builder(default = Value::Array(Vec::new()))]
    pub args: Value,
    #[builder(default = Value::Object(serde_json::Map::new()))]
    pub kwargs: Value,

    // Scheduling
    #[builder(default)]
    pub status: TaskStatus,
    #[builder(default = 0)]
    pub priority: i32,
    #[builder(default = 0)]
    pub attempt_count: i32,
    #[builder(default = 3)]
    pub max_retries: i32,
    #[builder(default = Utc::now())]
    pub not_before: DateTime<Utc>,

    // Lock management
    #[builder(default, setter(strip_option))]
    pub locked_by: Option<String>,
    #[builder(default, setter(strip_option))]
    pub locked_at: Option<DateTime<Utc>>,

    // Outcome
    #[builder(default, setter(strip_option))]
    pub result: Option<Value>,
    #[builder(default, setter(strip_option))]
    pub error: Option<Value>,

    // Timestamps
    #[builder(default = Utc::now())]
    pub created_at: DateTime<Utc>,
    #[builder(default = Utc::now())]
    pub updated_at: DateTime<Utc>,
}

impl Task {
    /// Eligible: pending, past `not_before`, and with an attempt left.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.status == TaskStatus::Pending && self.not_before <= now && self.can_retry()
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Whether another attempt is allowed after the ones already counted.
    pub fn can_retry(&self) -> bool {
        self.attempt_count <= self.max_retries
    }

    /// Decode the recorded failure, if any.
    pub fn task_error(&self) -> Option<TaskError> {
        let value = self.error.as_ref()?;
        Some(
            serde_json::from_value(value.clone())
                .unwrap_or_else(|_| TaskError::new(ErrorKind::Retryable, value.to_string())),
        )
    }
}

// ============================================================================
// Queries
// ============================================================================

impl Task {
    pub async fn find_by_id(id: Uuid, db: &PgPool) -> Result<Option<Self>> {
        let task = sqlx::query_as::<_, Self>("SELECT * FROM tasks WHERE id = $1")
            .bind(id)
            .fetch_optional(db)
            .await?;

        Ok(task)
    }

    /// Insert a new row. Returns `None` when the id already exists.
    ///
    /// Without `not_before` the row is eligible from the database's `NOW()`,
    /// not from the caller's clock.
    pub async fn insert(
        &self,
        not_before: Option<DateTime<Utc>>,
        db: &PgPool,
    ) -> Result<Option<Self>> {
        let task = sqlx::query_as::<_, Self>(
            r#"
            INSERT INTO tasks (
                id, name, args, kwargs, status, priority, attempt_count, max_retries,
                not_before, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, COALESCE($9, NOW()), NOW(), NOW())
            ON CONFLICT (id) DO NOTHING
            RETURNING *
            "#,
        )
        .bind(self.id)
        .bind(&self.name)
        .bind(&self.args)
        .bind(&self.kwargs)
        .bind(self.status)
        .bind(self.priority)
        .bind(self.attempt_count)
        .bind(self.max_retries)
        .bind(not_before)
        .fetch_optional(db)
        .await?;

        Ok(task)
    }

    /// Claim the next eligible task atomically using FOR UPDATE SKIP LOCKED.
    ///
    /// Order is `priority DESC, not_before ASC, id ASC`. Rows named in
    /// `skip_names` are left for other workers.
    pub async fn claim_next(
        worker_id: &str,
        skip_names: &[String],
        db: &PgPool,
    ) -> Result<Option<Self>> {
        let task = sqlx::query_as::<_, Self>(
            r#"
            WITH next_task AS (
                SELECT id
                FROM tasks
                WHERE status = 'pending'
                  AND not_before <= NOW()
                  AND attempt_count <= max_retries
                  AND NOT (name = ANY($2))
                ORDER BY priority DESC, not_before ASC, id ASC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE tasks
            SET
                status = 'running',
                locked_by = $1,
                locked_at = NOW(),
                attempt_count = tasks.attempt_count + 1,
                updated_at = NOW()
            FROM next_task
            WHERE tasks.id = next_task.id
            RETURNING tasks.*
            "#,
        )
        .bind(worker_id)
        .bind(skip_names)
        .fetch_optional(db)
        .await?;

        Ok(task)
    }

    pub async fn mark_succeeded(
        id: Uuid,
        worker_id: &str,
        result: &Value,
        db: &PgPool,
    ) -> Result<bool> {
        let outcome = sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'success',
                result = $3,
                error = NULL,
                locked_by = NULL,
                locked_at = NULL,
                updated_at = NOW()
            WHERE id = $1 AND status = 'running' AND locked_by = $2
            "#,
        )
        .bind(id)
        .bind(worker_id)
        .bind(result)
        .execute(db)
        .await?;

        Ok(outcome.rows_affected() > 0)
    }

    /// Return the row to pending, eligible again after `delay` (at most
    /// [`MAX_RETRY_DELAY`]).
    pub async fn schedule_retry(
        id: Uuid,
        worker_id: &str,
        delay: Duration,
        db: &PgPool,
    ) -> Result<bool> {
        let outcome = sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'pending',
                not_before = GREATEST(not_before, NOW() + ($3 || ' milliseconds')::INTERVAL),
                locked_by = NULL,
                locked_at = NULL,
                updated_at = NOW()
            WHERE id = $1 AND status = 'running' AND locked_by = $2
            "#,
        )
        .bind(id)
        .bind(worker_id)
        .bind(delay.min(MAX_RETRY_DELAY).as_millis().to_string())
        .execute(db)
        .await?;

        Ok(outcome.rows_affected() > 0)
    }

    pub async fn mark_failed(
        id: Uuid,
        worker_id: &str,
        error: &TaskError,
        db: &PgPool,
    ) -> Result<bool> {
        let outcome = sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'failure',
                error = $3,
                result = NULL,
                locked_by = NULL,
                locked_at = NULL,
                updated_at = NOW()
            WHERE id = $1 AND status = 'running' AND locked_by = $2
            "#,
        )
        .bind(id)
        .bind(worker_id)
        .bind(serde_json::to_value(error)?)
        .execute(db)
        .await?;

        Ok(outcome.rows_affected() > 0)
    }

    /// Hand a claimed row back untouched; the claim's attempt is not counted.
    pub async fn release(id: Uuid, worker_id: &str, db: &PgPool) -> Result<bool> {
        let outcome = sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'pending',
                attempt_count = attempt_count - 1,
                locked_by = NULL,
                locked_at = NULL,
                updated_at = NOW()
            WHERE id = $1 AND status = 'running' AND locked_by = $2
            "#,
        )
        .bind(id)
        .bind(worker_id)
        .execute(db)
        .await?;

        Ok(outcome.rows_affected() > 0)
    }

    /// Refresh `locked_at` for a row this worker still holds.
    pub async fn heartbeat(id: Uuid, worker_id: &str, db: &PgPool) -> Result<bool> {
        let outcome = sqlx::query(
            r#"
            UPDATE tasks
            SET locked_at = NOW(),
                updated_at = NOW()
            WHERE id = $1 AND status = 'running' AND locked_by = $2
            "#,
        )
        .bind(id)
        .bind(worker_id)
        .execute(db)
        .await?;

        Ok(outcome.rows_affected() > 0)
    }

    /// Cancel a pending task. Running and terminal rows are left alone.
    pub async fn cancel(id: Uuid, db: &PgPool) -> Result<bool> {
        let outcome = sqlx::query(
            r#"
            UPDATE tasks
            SET status = 'cancelled',
                updated_at = NOW()
            WHERE id = $1 AND status = 'pending'
            "#,
        )
        .bind(id)
        .execute(db)
        .await?;

        Ok(outcome.rows_affected() > 0)
    }

    /// Reset running rows whose lock is older than `stale_after`.
    ///
    /// The lost attempt stays counted. Rows that have no attempt left become
    /// FAILURE with a `worker_lost` error.
    pub async fn reap_stale(stale_after: Duration, db: &PgPool) -> Result<ReapReport> {
        let stale_ms = stale_after.as_millis().to_string();
        let mut tx = db.begin().await?;

        let failed = sqlx::query_scalar::<_, Uuid>(
            r#"
            UPDATE tasks
            SET status = 'failure',
                error = jsonb_build_object(
                    'kind', 'worker_lost',
                    'message', 'worker ' || locked_by || ' stopped responding',
                    'attempt', attempt_count,
                    'worker', locked_by
                ),
                locked_by = NULL,
                locked_at = NULL,
                updated_at = NOW()
            WHERE status = 'running'
              AND locked_at < NOW() - ($1 || ' milliseconds')::INTERVAL
              AND attempt_count > max_retries
            RETURNING id
            "#,
        )
        .bind(&stale_ms)
        .fetch_all(&mut *tx)
        .await?;

        let requeued = sqlx::query_scalar::<_, Uuid>(
            r#"
            UPDATE tasks
            SET status = 'pending',
                not_before = GREATEST(not_before, NOW()),
                locked_by = NULL,
                locked_at = NULL,
                updated_at = NOW()
            WHERE status = 'running'
              AND locked_at < NOW() - ($1 || ' milliseconds')::INTERVAL
            RETURNING id
            "#,
        )
        .bind(&stale_ms)
        .fetch_all(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(ReapReport { requeued, failed })
    }

    /// Per-status counts plus the eligible backlog.
    pub async fn stats(db: &PgPool) -> Result<QueueStats> {
        let counts = sqlx::query_as::<_, (TaskStatus, i64)>(
            "SELECT status, COUNT(*) FROM tasks GROUP BY status",
        )
        .fetch_all(db)
        .await?;

        let (eligible, oldest_eligible_at) = sqlx::query_as::<_, (i64, Option<DateTime<Utc>>)>(
            r#"
            SELECT COUNT(*), MIN(not_before)
            FROM tasks
            WHERE status = 'pending'
              AND not_before <= NOW()
              AND attempt_count <= max_retries
            "#,
        )
        .fetch_one(db)
        .await?;

        let mut stats = QueueStats {
            eligible,
            oldest_eligible_at,
            ..QueueStats::default()
        };
        for (status, count) in counts {
            stats.add(status, count);
        }

        Ok(stats)
    }
}
