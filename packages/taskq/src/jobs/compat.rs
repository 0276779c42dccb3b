//! Celery-shaped facade over [`TaskClient`].
//!
//! Existing call sites written against Celery's verbs keep their shape:
//!
//! ```ignore
//! let app = Celery::with_registry(client, registry.clone());
//! let result = app.signature("crawl_website").delay((url,)).await?;
//! let pages: Vec<String> = result.get_as(Some(Duration::from_secs(30))).await?;
//! ```
//!
//! Nothing here is persisted beyond what `TaskClient` writes.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use typed_builder::TypedBuilder;
use uuid::Uuid;

use super::client::{EnqueueOptions, TaskClient};
use super::registry::TaskRegistry;
use super::task::TaskStatus;
use crate::error::{QueueError, Result};

/// Options accepted by [`Signature::apply_async`].
#[derive(Debug, Clone, Default, TypedBuilder)]
#[builder(field_defaults(default, setter(strip_option)))]
pub struct ApplyOptions {
    pub task_id: Option<Uuid>,
    pub priority: Option<i32>,
    /// Delay before the task becomes eligible
    pub countdown: Option<Duration>,
    /// Absolute eligibility time. Mutually exclusive with `countdown`.
    pub eta: Option<DateTime<Utc>>,
    pub max_retries: Option<i32>,
}

#[derive(Clone)]
pub struct Celery {
    client: TaskClient,
    registry: Option<Arc<TaskRegistry>>,
}

impl Celery {
    pub fn new(client: TaskClient) -> Self {
        Self {
            client,
            registry: None,
        }
    }

    /// With a registry, tasks sent without an explicit `max_retries` use the
    /// registered policy's value.
    pub fn with_registry(client: TaskClient, registry: Arc<TaskRegistry>) -> Self {
        Self {
            client,
            registry: Some(registry),
        }
    }

    pub fn client(&self) -> &TaskClient {
        &self.client
    }

    pub fn signature(&self, name: impl Into<String>) -> Signature {
        Signature {
            name: name.into(),
            app: self.clone(),
        }
    }

    /// Send a task by name, like `app.send_task`.
    pub async fn send_task<A, K>(
        &self,
        name: &str,
        args: A,
        kwargs: K,
        options: ApplyOptions,
    ) -> Result<AsyncResult>
    where
        A: Serialize,
        K: Serialize,
    {
        let not_before = match (options.countdown, options.eta) {
            (Some(_), Some(_)) => {
                return Err(QueueError::Validation(format!(
                    "{name}: countdown and eta are mutually exclusive"
                )))
            }
            (Some(countdown), None) => Some(
                Utc::now()
                    + chrono::Duration::from_std(countdown).map_err(|e| {
                        QueueError::Validation(format!("{name}: countdown out of range: {e}"))
                    })?,
            ),
            (None, eta) => eta,
        };

        let max_retries = options.max_retries.or_else(|| {
            self.registry
                .as_ref()
                .and_then(|registry| registry.policy(name))
                .map(|policy| policy.max_retries)
        });

        let enqueue = EnqueueOptions {
            priority: options.priority,
            max_retries,
            id: options.task_id,
            not_before,
        };

        let handle = self.client.enqueue(name, args, kwargs, enqueue).await?;
        Ok(self.async_result(handle.id()))
    }

    /// Handle for a task id obtained elsewhere.
    pub fn async_result(&self, id: Uuid) -> AsyncResult {
        AsyncResult {
            id,
            client: self.client.clone(),
        }
    }
}

/// A task name bound to an app, ready to be called.
#[derive(Clone)]
pub struct Signature {
    name: String,
    app: Celery,
}

impl Signature {
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Enqueue with positional arguments and default options.
    pub async fn delay<A: Serialize>(&self, args: A) -> Result<AsyncResult> {
        self.apply_async(args, Value::Null, ApplyOptions::default())
            .await
    }

    pub async fn apply_async<A, K>(
        &self,
        args: A,
        kwargs: K,
        options: ApplyOptions,
    ) -> Result<AsyncResult>
    where
        A: Serialize,
        K: Serialize,
    {
        self.app.send_task(&self.name, args, kwargs, options).await
    }
}

/// Read side of a sent task.
#[derive(Clone)]
pub struct AsyncResult {
    id: Uuid,
    client: TaskClient,
}

impl AsyncResult {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub async fn status(&self) -> Result<TaskStatus> {
        self.client.get_status(self.id).await
    }

    /// Whether the task reached a terminal state.
    pub async fn ready(&self) -> Result<bool> {
        Ok(self.status().await?.is_terminal())
    }

    pub async fn successful(&self) -> Result<bool> {
        Ok(self.status().await? == TaskStatus::Success)
    }

    pub async fn failed(&self) -> Result<bool> {
        Ok(self.status().await? == TaskStatus::Failure)
    }

    /// Block until terminal. See [`TaskClient::get_result`].
    pub async fn get(&self, timeout: Option<Duration>) -> Result<Value> {
        self.client.get_result(self.id, timeout).await
    }

    pub async fn get_as<T: DeserializeOwned>(&self, timeout: Option<Duration>) -> Result<T> {
        self.client.get_result_as(self.id, timeout).await
    }

    /// Cancel if not yet started. Running tasks are not interrupted.
    pub async fn revoke(&self) -> Result<bool> {
        self.client.cancel(self.id).await
    }
}

impl std::fmt::Debug for AsyncResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AsyncResult").field("id", &self.id).finish()
    }
}
