//! In-memory task store for tests.
//!
//! Mirrors the state machine of [`PostgresTaskStore`](super::PostgresTaskStore)
//! behind a single mutex, so every operation is atomic the same way a
//! row-locking UPDATE is. Adds knobs the database cannot offer: a movable
//! clock, a claim counter and a simulated outage.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use serde_json::Value;

use super::retry::MAX_RETRY_DELAY;
use super::store::{Outcome, QueueStats, ReapReport, TaskStore};
use super::task::{contains_nul, ErrorKind, Task, TaskError, TaskStatus};
use crate::error::{QueueError, Result};

fn to_chrono(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration.min(MAX_RETRY_DELAY))
        .unwrap_or_else(|_| chrono::Duration::days(36_500))
}

/// Reject what a `jsonb` column would reject, with the same error class.
fn storable(value: &Value) -> Result<()> {
    if contains_nul(value) {
        return Err(QueueError::Database(sqlx::Error::Encode(
            "unsupported Unicode escape sequence: \\u0000 cannot be stored".into(),
        )));
    }
    Ok(())
}

#[derive(Default)]
pub struct MemoryTaskStore {
    tasks: Mutex<HashMap<Uuid, Task>>,
    clock_offset_ms: AtomicI64,
    claims: AtomicU64,
    unavailable: AtomicBool,
}

impl MemoryTaskStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn tasks(&self) -> MutexGuard<'_, HashMap<Uuid, Task>> {
        self.tasks.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn check_available(&self) -> Result<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(QueueError::StoreUnavailable(sqlx::Error::PoolTimedOut));
        }
        Ok(())
    }

    /// The store's notion of "now".
    pub fn now(&self) -> DateTime<Utc> {
        Utc::now() + chrono::Duration::milliseconds(self.clock_offset_ms.load(Ordering::SeqCst))
    }

    /// Move the store clock forward.
    pub fn advance(&self, by: Duration) {
        let ms = i64::try_from(by.as_millis()).unwrap_or(i64::MAX);
        self.clock_offset_ms.fetch_add(ms, Ordering::SeqCst);
    }

    /// Number of successful claims issued so far.
    pub fn claims_issued(&self) -> u64 {
        self.claims.load(Ordering::SeqCst)
    }

    /// Make every operation fail with `StoreUnavailable` until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Snapshot of all rows.
    pub fn all_tasks(&self) -> Vec<Task> {
        self.tasks().values().cloned().collect()
    }

    /// Overwrite a row directly (test setup).
    pub fn put(&self, task: Task) {
        self.tasks().insert(task.id, task);
    }
}

fn held_by<'a>(
    tasks: &'a mut HashMap<Uuid, Task>,
    id: Uuid,
    worker_id: &str,
) -> Option<&'a mut Task> {
    tasks.get_mut(&id).filter(|task| {
        task.status == TaskStatus::Running && task.locked_by.as_deref() == Some(worker_id)
    })
}

fn clear_lock(task: &mut Task, now: DateTime<Utc>) {
    task.locked_by = None;
    task.locked_at = None;
    task.updated_at = now;
}

#[async_trait]
impl TaskStore for MemoryTaskStore {
    async fn insert(
        &self,
        task: &Task,
        not_before: Option<DateTime<Utc>>,
    ) -> Result<Option<Task>> {
        self.check_available()?;
        storable(&task.args)?;
        storable(&task.kwargs)?;
        let now = self.now();
        let mut tasks = self.tasks();
        if tasks.contains_key(&task.id) {
            return Ok(None);
        }

        let mut stored = task.clone();
        stored.not_before = not_before.unwrap_or(now);
        stored.created_at = now;
        stored.updated_at = now;
        tasks.insert(stored.id, stored.clone());
        Ok(Some(stored))
    }

    async fn get(&self, id: Uuid) -> Result<Option<Task>> {
        self.check_available()?;
        Ok(self.tasks().get(&id).cloned())
    }

    async fn claim(&self, worker_id: &str, skip_names: &[String]) -> Result<Option<Task>> {
        self.check_available()?;
        let now = self.now();
        let mut tasks = self.tasks();

        let next = tasks
            .values()
            .filter(|task| task.is_eligible(now) && !skip_names.contains(&task.name))
            .min_by(|a, b| {
                b.priority
                    .cmp(&a.priority)
                    .then(a.not_before.cmp(&b.not_before))
                    .then(a.id.cmp(&b.id))
            })
            .map(|task| task.id);

        let Some(id) = next else {
            return Ok(None);
        };
        let Some(task) = tasks.get_mut(&id) else {
            return Ok(None);
        };

        task.status = TaskStatus::Running;
        task.locked_by = Some(worker_id.to_string());
        task.locked_at = Some(now);
        task.attempt_count += 1;
        task.updated_at = now;
        self.claims.fetch_add(1, Ordering::SeqCst);

        Ok(Some(task.clone()))
    }

    async fn record_outcome(&self, id: Uuid, worker_id: &str, outcome: Outcome) -> Result<bool> {
        self.check_available()?;
        let now = self.now();
        let mut tasks = self.tasks();
        let Some(task) = held_by(&mut tasks, id, worker_id) else {
            return Ok(false);
        };

        match outcome {
            Outcome::Success(value) => {
                storable(&value)?;
                task.status = TaskStatus::Success;
                task.result = Some(value);
                task.error = None;
            }
            Outcome::Retry { delay } => {
                task.status = TaskStatus::Pending;
                task.not_before = task.not_before.max(now + to_chrono(delay));
            }
            Outcome::Failure(error) => {
                let error = serde_json::to_value(&error)?;
                storable(&error)?;
                task.status = TaskStatus::Failure;
                task.error = Some(error);
                task.result = None;
            }
        }
        clear_lock(task, now);

        Ok(true)
    }

    async fn release(&self, id: Uuid, worker_id: &str) -> Result<bool> {
        self.check_available()?;
        let now = self.now();
        let mut tasks = self.tasks();
        let Some(task) = held_by(&mut tasks, id, worker_id) else {
            return Ok(false);
        };

        task.status = TaskStatus::Pending;
        task.attempt_count -= 1;
        clear_lock(task, now);

        Ok(true)
    }

    async fn heartbeat(&self, id: Uuid, worker_id: &str) -> Result<bool> {
        self.check_available()?;
        let now = self.now();
        let mut tasks = self.tasks();
        let Some(task) = held_by(&mut tasks, id, worker_id) else {
            return Ok(false);
        };

        task.locked_at = Some(now);
        task.updated_at = now;

        Ok(true)
    }

    async fn cancel(&self, id: Uuid) -> Result<bool> {
        self.check_available()?;
        let now = self.now();
        let mut tasks = self.tasks();
        match tasks.get_mut(&id) {
            Some(task) if task.status == TaskStatus::Pending => {
                task.status = TaskStatus::Cancelled;
                task.updated_at = now;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn reap_stale(&self, stale_after: Duration) -> Result<ReapReport> {
        self.check_available()?;
        let now = self.now();
        let cutoff = now - to_chrono(stale_after);
        let mut report = ReapReport::default();

        for task in self.tasks().values_mut() {
            let stale = task.status == TaskStatus::Running
                && task.locked_at.is_some_and(|locked_at| locked_at < cutoff);
            if !stale {
                continue;
            }

            let worker = task.locked_by.clone().unwrap_or_default();
            if task.can_retry() {
                task.status = TaskStatus::Pending;
                task.not_before = task.not_before.max(now);
                report.requeued.push(task.id);
            } else {
                let error = TaskError {
                    kind: ErrorKind::WorkerLost,
                    message: format!("worker {worker} stopped responding"),
                    chain: Vec::new(),
                    attempt: task.attempt_count,
                    worker: Some(worker),
                };
                task.status = TaskStatus::Failure;
                task.error = Some(serde_json::to_value(&error)?);
                report.failed.push(task.id);
            }
            clear_lock(task, now);
        }

        Ok(report)
    }

    async fn stats(&self) -> Result<QueueStats> {
        self.check_available()?;
        let now = self.now();
        let tasks = self.tasks();
        let mut stats = QueueStats::default();

        for task in tasks.values() {
            stats.add(task.status, 1);
            if task.is_eligible(now) {
                stats.eligible += 1;
                stats.oldest_eligible_at = Some(match stats.oldest_eligible_at {
                    Some(oldest) => oldest.min(task.not_before),
                    None => task.not_before,
                });
            }
        }

        Ok(stats)
    }
}
