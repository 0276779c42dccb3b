//! Structured error types for the task queue.
//!
//! `QueueError` is what crosses the library boundary. Handler bodies are free
//! to use `anyhow`; their failures are captured by the worker and persisted as
//! a [`TaskError`](crate::jobs::TaskError) instead of being propagated.

use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

use crate::jobs::TaskError;

/// Result alias used throughout the crate.
pub type Result<T, E = QueueError> = std::result::Result<T, E>;

#[derive(Debug, Error)]
pub enum QueueError {
    /// Malformed enqueue request. Nothing was written.
    #[error("invalid task request: {0}")]
    Validation(String),

    /// A claimed row names a handler this process does not have.
    #[error("task {name:?} is not registered")]
    TaskNotRegistered { name: String },

    /// The task reached FAILURE; carries the recorded error.
    #[error("task {id} failed: {}", error.message)]
    TaskFailed { id: Uuid, error: TaskError },

    #[error("task {0} was cancelled")]
    Cancelled(Uuid),

    /// The caller's wait expired. The task itself is unaffected.
    #[error("timed out after {waited:?} waiting for task {id}")]
    Timeout { id: Uuid, waited: Duration },

    #[error("task {0} not found")]
    NotFound(Uuid),

    /// The database could not be reached.
    #[error("task store unavailable: {0}")]
    StoreUnavailable(#[source] sqlx::Error),

    #[error("database error: {0}")]
    Database(#[source] sqlx::Error),

    #[error("migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

impl QueueError {
    /// Whether this is a connectivity failure callers should back off on.
    pub fn is_store_unavailable(&self) -> bool {
        matches!(self, QueueError::StoreUnavailable(_))
    }
}

impl From<sqlx::Error> for QueueError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Io(_)
            | sqlx::Error::Tls(_)
            | sqlx::Error::Protocol(_)
            | sqlx::Error::PoolTimedOut
            | sqlx::Error::PoolClosed
            | sqlx::Error::WorkerCrashed => QueueError::StoreUnavailable(err),
            other => QueueError::Database(other),
        }
    }
}
