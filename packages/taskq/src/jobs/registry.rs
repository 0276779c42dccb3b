//! Task registry for looking up and invoking handlers.
//!
//! The registry maps task names (e.g., "crawl_website") to:
//! - A handler that receives the deserialized `args`/`kwargs`
//! - The retry policy used when that handler fails
//!
//! Registration happens once at process start. A worker claiming a row whose
//! name is missing here releases the row for another worker.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::{Map, Value};
use tracing::warn;
use uuid::Uuid;

use super::retry::RetryPolicy;
use super::task::{NonRetryable, Task};
use crate::error::{QueueError, Result};

/// Future returned by a boxed handler.
pub type HandlerFuture = Pin<Box<dyn Future<Output = anyhow::Result<Value>> + Send>>;

type BoxedHandler = Arc<dyn Fn(TaskInvocation) -> HandlerFuture + Send + Sync>;

/// What a handler receives for one attempt.
#[derive(Debug, Clone)]
pub struct TaskInvocation {
    pub id: Uuid,
    pub name: String,
    /// 1-based attempt number
    pub attempt: i32,
    pub args: Vec<Value>,
    pub kwargs: Map<String, Value>,
}

impl TaskInvocation {
    pub fn from_task(task: &Task) -> Self {
        let args = match &task.args {
            Value::Array(items) => items.clone(),
            _ => Vec::new(),
        };
        let kwargs = match &task.kwargs {
            Value::Object(map) => map.clone(),
            _ => Map::new(),
        };

        Self {
            id: task.id,
            name: task.name.clone(),
            attempt: task.attempt_count,
            args,
            kwargs,
        }
    }

    /// Deserialize positional argument `index`.
    ///
    /// A missing or mistyped argument will not fix itself, so the error is
    /// non-retryable.
    pub fn arg<T: DeserializeOwned>(&self, index: usize) -> anyhow::Result<T> {
        let value = self.args.get(index).ok_or_else(|| {
            NonRetryable::error(format!("{}: missing positional argument {index}", self.name))
        })?;

        serde_json::from_value(value.clone()).map_err(|e| {
            NonRetryable::error(format!("{}: invalid argument {index}: {e}", self.name))
        })
    }

    /// Deserialize keyword argument `key`, `None` if absent.
    pub fn kwarg<T: DeserializeOwned>(&self, key: &str) -> anyhow::Result<Option<T>> {
        match self.kwargs.get(key) {
            None => Ok(None),
            Some(value) => serde_json::from_value(value.clone()).map(Some).map_err(|e| {
                NonRetryable::error(format!("{}: invalid keyword argument {key}: {e}", self.name))
            }),
        }
    }

    /// Deserialize the whole positional list, e.g. into a tuple.
    pub fn args_as<T: DeserializeOwned>(&self) -> anyhow::Result<T> {
        serde_json::from_value(Value::Array(self.args.clone()))
            .map_err(|e| NonRetryable::error(format!("{}: invalid arguments: {e}", self.name)))
    }
}

/// Registration entry: handler plus retry policy.
pub struct RegisteredTask {
    pub policy: RetryPolicy,
    handler: BoxedHandler,
}

impl RegisteredTask {
    pub fn invoke(&self, invocation: TaskInvocation) -> HandlerFuture {
        (self.handler)(invocation)
    }
}

/// Registry that maps task names to handlers.
///
/// # Example
///
/// ```
/// # use std::sync::Arc;
/// # use taskq::jobs::{MemoryTaskStore, RetryPolicy, TaskRegistry, TaskWorker, WorkerConfig};
/// # fn main() -> taskq::Result<()> {
/// # let store = Arc::new(MemoryTaskStore::new());
/// let mut registry = TaskRegistry::new();
///
/// registry.register("echo", RetryPolicy::default(), |task| async move {
///     task.arg::<serde_json::Value>(0)
/// })?;
///
/// let worker = TaskWorker::with_config(store, Arc::new(registry), WorkerConfig::default());
/// # let _ = worker;
/// # Ok(())
/// # }
/// ```
#[derive(Default)]
pub struct TaskRegistry {
    registrations: HashMap<String, RegisteredTask>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self {
            registrations: HashMap::new(),
        }
    }

    /// Register a handler under `name`.
    ///
    /// The handler's return value must serialize to JSON; it becomes the
    /// task's stored result. Registering the same name twice replaces the
    /// earlier handler.
    pub fn register<F, Fut, R>(
        &mut self,
        name: impl Into<String>,
        policy: RetryPolicy,
        handler: F,
    ) -> Result<&mut Self>
    where
        F: Fn(TaskInvocation) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
        R: Serialize + Send + 'static,
    {
        let name = name.into();
        if name.trim().is_empty() {
            return Err(QueueError::Validation(
                "task name must not be empty".to_string(),
            ));
        }

        let task_name = name.clone();
        let boxed_handler: BoxedHandler = Arc::new(move |invocation: TaskInvocation| -> HandlerFuture {
            let task_name = task_name.clone();
            let fut = handler(invocation);
            Box::pin(async move {
                let value = fut.await?;
                serde_json::to_value(value).map_err(|e| {
                    NonRetryable::error(format!("{task_name}: result is not serializable: {e}"))
                })
            })
        });

        if self.registrations.contains_key(&name) {
            warn!(task = %name, "replacing existing task registration");
        }

        self.registrations.insert(
            name,
            RegisteredTask {
                policy,
                handler: boxed_handler,
            },
        );

        Ok(self)
    }

    /// Look up a handler by task name.
    pub fn lookup(&self, name: &str) -> Result<&RegisteredTask> {
        self.registrations
            .get(name)
            .ok_or_else(|| QueueError::TaskNotRegistered {
                name: name.to_string(),
            })
    }

    /// Retry policy for `name`, if registered.
    pub fn policy(&self, name: &str) -> Option<&RetryPolicy> {
        self.registrations.get(name).map(|entry| &entry.policy)
    }

    pub fn is_registered(&self, name: &str) -> bool {
        self.registrations.contains_key(name)
    }

    pub fn registered_names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.registrations.keys().map(String::as_str).collect();
        names.sort_unstable();
        names
    }

    pub fn len(&self) -> usize {
        self.registrations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.registrations.is_empty()
    }
}

/// Run a registered handler directly, outside any worker.
///
/// Useful for eager execution in tests.
pub async fn invoke_eager(
    registry: &TaskRegistry,
    name: &str,
    args: Vec<Value>,
    kwargs: Map<String, Value>,
) -> anyhow::Result<Value> {
    let entry = registry.lookup(name).map_err(anyhow::Error::new)?;
    entry
        .invoke(TaskInvocation {
            id: Uuid::nil(),
            name: name.to_string(),
            attempt: 1,
            args,
            kwargs,
        })
        .await
}
