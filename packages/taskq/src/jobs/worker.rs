//! Task worker service.
//!
//! The `TaskWorker` is a long-running service that:
//! - Claims one eligible row at a time per execution slot
//! - Looks up the handler in the `TaskRegistry`
//! - Runs the handler in its own tokio task, so a panic is an ordinary failure
//! - Heartbeats the row while the handler runs
//! - Records success, a delayed retry, or a terminal failure
//!
//! # Architecture
//!
//! ```text
//! TaskWorker
//!     │
//!     ├─► slot 0 ─┐
//!     ├─► slot 1 ─┼─► claim ─► lookup ─► spawn handler ─► record outcome
//!     └─► slot N ─┘     │                     │
//!                       │ nothing eligible    └─► heartbeat every interval
//!                       └─► sleep poll_interval + jitter
//! ```
//!
//! Slots share nothing but the store. Each holds rows under its own
//! `locked_by` value (`{worker_id}/{slot}`), so a slot's writes are fenced
//! against every other slot and process.

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use serde_json::Value;
use tokio::task::JoinError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use super::registry::{RegisteredTask, TaskInvocation, TaskRegistry};
use super::store::{Outcome, TaskStore};
use super::task::{ErrorKind, Task, TaskError};
use crate::error::{QueueError, Result};

/// Attempts made to write an outcome while the store is unreachable.
const RECORD_ATTEMPTS: u32 = 3;

/// Configuration for the task worker.
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Process identity; slots append `/{slot}`
    pub worker_id: String,
    /// Number of tasks executed concurrently
    pub concurrency: usize,
    /// Sleep between claim attempts when the queue is empty
    pub poll_interval: Duration,
    /// Upper bound of the random delay added to each idle sleep
    pub poll_jitter: Duration,
    /// How often a running row's lock is refreshed. `None` disables it.
    pub heartbeat_interval: Option<Duration>,
    /// Ceiling for the pause after consecutive store errors
    pub max_store_backoff: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            worker_id: default_worker_id(),
            concurrency: 1,
            poll_interval: Duration::from_secs(1),
            poll_jitter: Duration::from_millis(250),
            heartbeat_interval: Some(Duration::from_secs(30)),
            max_store_backoff: Duration::from_secs(30),
        }
    }
}

impl WorkerConfig {
    /// Create a new config with a specific worker ID.
    pub fn with_worker_id(worker_id: impl Into<String>) -> Self {
        Self {
            worker_id: worker_id.into(),
            ..Default::default()
        }
    }
}

/// `hostname:pid:random`, unique per process even across restarts.
pub fn default_worker_id() -> String {
    let host = std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "localhost".to_string());
    format!("{host}:{}:{}", std::process::id(), Uuid::new_v4().simple())
}

/// A worker that executes tasks from a [`TaskStore`].
pub struct TaskWorker {
    store: Arc<dyn TaskStore>,
    registry: Arc<TaskRegistry>,
    config: WorkerConfig,
}

impl TaskWorker {
    pub fn new(store: Arc<dyn TaskStore>, registry: Arc<TaskRegistry>) -> Self {
        Self::with_config(store, registry, WorkerConfig::default())
    }

    pub fn with_config(
        store: Arc<dyn TaskStore>,
        registry: Arc<TaskRegistry>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            store,
            registry,
            config,
        }
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    /// Run every slot until `shutdown` fires.
    ///
    /// A slot finishes the task it is executing before it stops; handlers
    /// are never interrupted.
    pub async fn run(self, shutdown: CancellationToken) -> Result<()> {
        let concurrency = self.config.concurrency.max(1);
        info!(
            worker_id = %self.config.worker_id,
            concurrency,
            tasks = ?self.registry.registered_names(),
            "task worker starting"
        );

        let slots = (0..concurrency).map(|slot| self.run_slot(slot, &shutdown));
        join_all(slots).await;

        info!(worker_id = %self.config.worker_id, "task worker stopped");
        Ok(())
    }

    async fn run_slot(&self, slot: usize, shutdown: &CancellationToken) {
        let worker_id = format!("{}/{}", self.config.worker_id, slot);
        // Names this process cannot run. The registry never changes after
        // start, so a miss is permanent for this slot.
        let mut skip_names: Vec<String> = Vec::new();
        let mut store_failures: u32 = 0;

        debug!(worker_id = %worker_id, "slot started");

        loop {
            if shutdown.is_cancelled() {
                break;
            }

            let pause = match self.store.claim(&worker_id, &skip_names).await {
                Ok(Some(task)) => {
                    store_failures = 0;
                    self.process(task, &worker_id, &mut skip_names).await;
                    continue;
                }
                Ok(None) => {
                    store_failures = 0;
                    self.idle_delay()
                }
                Err(e) => {
                    store_failures = store_failures.saturating_add(1);
                    let pause = self.store_backoff(store_failures);
                    if e.is_store_unavailable() {
                        warn!(worker_id = %worker_id, error = %e, retry_in = ?pause, "task store unavailable");
                    } else {
                        error!(worker_id = %worker_id, error = %e, retry_in = ?pause, "failed to claim task");
                    }
                    pause
                }
            };

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(pause) => {}
            }
        }

        debug!(worker_id = %worker_id, "slot stopped");
    }

    /// Claim and process a single task as slot 0.
    ///
    /// Returns false when nothing was eligible.
    pub async fn run_once(&self) -> Result<bool> {
        let worker_id = format!("{}/0", self.config.worker_id);
        let Some(task) = self.store.claim(&worker_id, &[]).await? else {
            return Ok(false);
        };

        let mut skip_names = Vec::new();
        self.process(task, &worker_id, &mut skip_names).await;
        Ok(true)
    }

    /// Process a single claimed task.
    async fn process(&self, task: Task, worker_id: &str, skip_names: &mut Vec<String>) {
        let entry = match self.registry.lookup(&task.name) {
            Ok(entry) => entry,
            Err(e) => {
                warn!(
                    task_id = %task.id,
                    task = %task.name,
                    worker_id = %worker_id,
                    error = %e,
                    "no handler registered, returning task to the queue"
                );
                match self.store.release(task.id, worker_id).await {
                    Ok(true) => {}
                    Ok(false) => warn!(task_id = %task.id, "lock lost before release"),
                    Err(e) => error!(task_id = %task.id, error = %e, "failed to release task"),
                }
                if !skip_names.contains(&task.name) {
                    skip_names.push(task.name.clone());
                }
                return;
            }
        };

        debug!(
            task_id = %task.id,
            task = %task.name,
            attempt = task.attempt_count,
            worker_id = %worker_id,
            "executing task"
        );

        let outcome = match self.execute_with_heartbeat(&task, entry, worker_id).await {
            Ok(value) => {
                debug!(task_id = %task.id, task = %task.name, "task succeeded");
                Outcome::Success(value)
            }
            Err(failure) => {
                let outcome = entry.policy.on_failure(&task, failure);
                match &outcome {
                    Outcome::Retry { delay } => warn!(
                        task_id = %task.id,
                        task = %task.name,
                        attempt = task.attempt_count,
                        retry_in = ?delay,
                        "task failed, will retry"
                    ),
                    Outcome::Failure(error) => error!(
                        task_id = %task.id,
                        task = %task.name,
                        attempt = task.attempt_count,
                        kind = ?error.kind,
                        error = %error.message,
                        "task failed permanently"
                    ),
                    Outcome::Success(_) => {}
                }
                outcome
            }
        };

        self.record(&task, worker_id, outcome).await;
    }

    /// Run the handler in its own task, refreshing the lock while it runs.
    async fn execute_with_heartbeat(
        &self,
        task: &Task,
        entry: &RegisteredTask,
        worker_id: &str,
    ) -> std::result::Result<Value, TaskError> {
        let mut handle = tokio::spawn(entry.invoke(TaskInvocation::from_task(task)));

        let heartbeat = self.config.heartbeat_interval.filter(|every| !every.is_zero());
        let joined = match heartbeat {
            None => (&mut handle).await,
            Some(every) => {
                let mut ticker = tokio::time::interval(every);
                ticker.tick().await; // Skip first immediate tick

                loop {
                    tokio::select! {
                        joined = &mut handle => break joined,
                        _ = ticker.tick() => {
                            match self.store.heartbeat(task.id, worker_id).await {
                                Ok(true) => {}
                                Ok(false) => warn!(
                                    task_id = %task.id,
                                    worker_id = %worker_id,
                                    "lock lost while running, outcome will be discarded"
                                ),
                                Err(e) => warn!(task_id = %task.id, error = %e, "heartbeat failed"),
                            }
                        }
                    }
                }
            }
        };

        match joined {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(TaskError::from_handler(&err, task.attempt_count, worker_id)),
            Err(join_error) => Err(TaskError::panicked(
                panic_message(join_error),
                task.attempt_count,
                worker_id,
            )),
        }
    }

    /// Persist the outcome, retrying briefly if the store is unreachable.
    ///
    /// An outcome the store rejects outright (a result `jsonb` cannot hold,
    /// say) is replaced once by a non-retryable failure so the row still
    /// ends terminal. Giving up leaves the row RUNNING; the reaper recovers it.
    async fn record(&self, task: &Task, worker_id: &str, outcome: Outcome) {
        let mut outcome = outcome;
        let mut replaced = false;
        let mut attempt = 1;
        loop {
            match self
                .store
                .record_outcome(task.id, worker_id, outcome.clone())
                .await
            {
                Ok(true) => return,
                Ok(false) => {
                    warn!(
                        task_id = %task.id,
                        worker_id = %worker_id,
                        "row no longer held by this worker, outcome discarded"
                    );
                    return;
                }
                Err(e) if e.is_store_unavailable() && attempt < RECORD_ATTEMPTS => {
                    let pause = self.store_backoff(attempt);
                    warn!(task_id = %task.id, error = %e, retry_in = ?pause, "failed to record outcome, retrying");
                    tokio::time::sleep(pause).await;
                    attempt += 1;
                }
                Err(e) if !e.is_store_unavailable() && !replaced => {
                    error!(task_id = %task.id, error = %e, "store rejected outcome, recording failure instead");
                    outcome = Outcome::Failure(unstorable_outcome(&e, task, worker_id));
                    replaced = true;
                    attempt = 1;
                }
                Err(e) => {
                    error!(task_id = %task.id, error = %e, "failed to record outcome");
                    return;
                }
            }
        }
    }

    fn idle_delay(&self) -> Duration {
        let jitter_ms = u64::try_from(self.config.poll_jitter.as_millis()).unwrap_or(u64::MAX);
        let jitter = if jitter_ms == 0 {
            Duration::ZERO
        } else {
            Duration::from_millis(fastrand::u64(0..=jitter_ms))
        };
        self.config.poll_interval + jitter
    }

    fn store_backoff(&self, failures: u32) -> Duration {
        let factor = 1u32 << failures.saturating_sub(1).min(16);
        self.config
            .poll_interval
            .saturating_mul(factor)
            .min(self.config.max_store_backoff)
    }
}

/// Terminal error recorded in place of an outcome the store refused.
fn unstorable_outcome(cause: &QueueError, task: &Task, worker_id: &str) -> TaskError {
    TaskError {
        attempt: task.attempt_count,
        worker: Some(worker_id.to_string()),
        ..TaskError::new(
            ErrorKind::NonRetryable,
            format!("result could not be stored: {cause}").replace('\0', ""),
        )
    }
}

fn panic_message(join_error: JoinError) -> String {
    if !join_error.is_panic() {
        return "handler was cancelled".to_string();
    }

    let payload = join_error.into_panic();
    if let Some(message) = payload.downcast_ref::<&str>() {
        format!("handler panicked: {message}")
    } else if let Some(message) = payload.downcast_ref::<String>() {
        format!("handler panicked: {message}")
    } else {
        "handler panicked".to_string()
    }
}
