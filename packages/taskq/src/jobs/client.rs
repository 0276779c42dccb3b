//! Submission client: enqueue tasks and read their outcome.
//!
//! Producers never talk to workers. They write a PENDING row and later read
//! the same row back, either once (`get_status`) or by polling until it
//! reaches a terminal state (`get_result`).

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use tokio::time::Instant;
use tracing::{debug, info};
use typed_builder::TypedBuilder;
use uuid::Uuid;

use super::store::TaskStore;
use super::task::{contains_nul, task_id, ErrorKind, Task, TaskError, TaskStatus};
use crate::error::{QueueError, Result};

/// Defaults applied to every enqueue that does not override them.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    pub default_priority: i32,
    pub default_max_retries: i32,
    /// How often `get_result` re-reads the row
    pub result_poll_interval: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            default_priority: 0,
            default_max_retries: 3,
            result_poll_interval: Duration::from_millis(100),
        }
    }
}

/// Per-call overrides for [`TaskClient::enqueue`].
#[derive(Debug, Clone, Default, TypedBuilder)]
#[builder(field_defaults(default, setter(strip_option)))]
pub struct EnqueueOptions {
    pub priority: Option<i32>,
    pub max_retries: Option<i32>,
    /// Caller-supplied id. Enqueueing an existing id is a no-op.
    pub id: Option<Uuid>,
    /// Earliest time a worker may claim the task. Defaults to the store's
    /// clock at insert time.
    pub not_before: Option<DateTime<Utc>>,
}

/// Returned by `enqueue`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskHandle {
    id: Uuid,
    created: bool,
}

impl TaskHandle {
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// False when the id already existed and nothing was written.
    pub fn is_created(&self) -> bool {
        self.created
    }
}

#[derive(Clone)]
pub struct TaskClient {
    store: Arc<dyn TaskStore>,
    config: ClientConfig,
}

impl TaskClient {
    pub fn new(store: Arc<dyn TaskStore>) -> Self {
        Self::with_config(store, ClientConfig::default())
    }

    pub fn with_config(store: Arc<dyn TaskStore>, config: ClientConfig) -> Self {
        Self { store, config }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Insert a PENDING task.
    ///
    /// `args` must serialize to a JSON array and `kwargs` to an object (or
    /// `null`, read as no keyword arguments). Strings and keys must not
    /// contain NUL. Nothing is written when validation fails.
    ///
    /// Payloads go through `serde_json`, which has no representation for
    /// non-finite floats: `NaN` and the infinities are stored as `null`.
    /// Handlers that need them should carry them as strings.
    pub async fn enqueue<A, K>(
        &self,
        name: &str,
        args: A,
        kwargs: K,
        options: EnqueueOptions,
    ) -> Result<TaskHandle>
    where
        A: Serialize,
        K: Serialize,
    {
        if name.trim().is_empty() {
            return Err(QueueError::Validation(
                "task name must not be empty".to_string(),
            ));
        }

        let args = match serde_json::to_value(args) {
            Ok(value @ Value::Array(_)) => value,
            Ok(other) => {
                return Err(QueueError::Validation(format!(
                    "{name}: args must be a sequence, got {}",
                    json_type(&other)
                )))
            }
            Err(e) => {
                return Err(QueueError::Validation(format!(
                    "{name}: args are not serializable: {e}"
                )))
            }
        };

        let kwargs = match serde_json::to_value(kwargs) {
            Ok(Value::Null) => Value::Object(Map::new()),
            Ok(value @ Value::Object(_)) => value,
            Ok(other) => {
                return Err(QueueError::Validation(format!(
                    "{name}: kwargs must be a mapping, got {}",
                    json_type(&other)
                )))
            }
            Err(e) => {
                return Err(QueueError::Validation(format!(
                    "{name}: kwargs are not serializable: {e}"
                )))
            }
        };

        if contains_nul(&args) || contains_nul(&kwargs) {
            return Err(QueueError::Validation(format!(
                "{name}: payload strings must not contain NUL characters"
            )));
        }

        let max_retries = options
            .max_retries
            .unwrap_or(self.config.default_max_retries);
        if max_retries < 0 {
            return Err(QueueError::Validation(format!(
                "{name}: max_retries must not be negative"
            )));
        }

        let task = Task::builder()
            .id(options.id.unwrap_or_else(task_id))
            .name(name)
            .args(args)
            .kwargs(kwargs)
            .priority(options.priority.unwrap_or(self.config.default_priority))
            .max_retries(max_retries)
            .build();

        match self.store.insert(&task, options.not_before).await? {
            Some(inserted) => {
                info!(
                    task_id = %inserted.id,
                    task = %inserted.name,
                    priority = inserted.priority,
                    "task enqueued"
                );
                Ok(TaskHandle {
                    id: inserted.id,
                    created: true,
                })
            }
            None => {
                debug!(task_id = %task.id, task = %task.name, "task id already exists, enqueue skipped");
                Ok(TaskHandle {
                    id: task.id,
                    created: false,
                })
            }
        }
    }

    /// Full row, for callers that need more than the status.
    pub async fn get(&self, id: Uuid) -> Result<Task> {
        self.store.get(id).await?.ok_or(QueueError::NotFound(id))
    }

    pub async fn get_status(&self, id: Uuid) -> Result<TaskStatus> {
        Ok(self.get(id).await?.status)
    }

    /// Wait until the task is terminal and return its result.
    ///
    /// A FAILURE row surfaces as [`QueueError::TaskFailed`] carrying the
    /// recorded error, a CANCELLED row as [`QueueError::Cancelled`]. With
    /// `timeout = None` the wait is unbounded. Timing out does not touch the
    /// task itself.
    pub async fn get_result(&self, id: Uuid, timeout: Option<Duration>) -> Result<Value> {
        let started = Instant::now();

        loop {
            let task = self.get(id).await?;
            match task.status {
                TaskStatus::Success => return Ok(task.result.unwrap_or(Value::Null)),
                TaskStatus::Failure => {
                    let error = task.task_error().unwrap_or_else(|| {
                        TaskError::new(ErrorKind::Retryable, "failed without recorded error")
                    });
                    return Err(QueueError::TaskFailed { id, error });
                }
                TaskStatus::Cancelled => return Err(QueueError::Cancelled(id)),
                TaskStatus::Pending | TaskStatus::Running => {}
            }

            let mut pause = self.config.result_poll_interval;
            if let Some(timeout) = timeout {
                let waited = started.elapsed();
                if waited >= timeout {
                    return Err(QueueError::Timeout { id, waited });
                }
                pause = pause.min(timeout - waited);
            }
            tokio::time::sleep(pause).await;
        }
    }

    /// `get_result` decoded into `T`.
    pub async fn get_result_as<T: DeserializeOwned>(
        &self,
        id: Uuid,
        timeout: Option<Duration>,
    ) -> Result<T> {
        let value = self.get_result(id, timeout).await?;
        Ok(serde_json::from_value(value)?)
    }

    /// Cancel a task that has not started. False if it is already running,
    /// terminal or unknown.
    pub async fn cancel(&self, id: Uuid) -> Result<bool> {
        let cancelled = self.store.cancel(id).await?;
        if cancelled {
            info!(task_id = %id, "task cancelled");
        } else {
            debug!(task_id = %id, "cancel ignored, task is not pending");
        }
        Ok(cancelled)
    }
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
