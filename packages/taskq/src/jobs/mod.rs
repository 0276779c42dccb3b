//! Task queue infrastructure.
//!
//! - [`TaskClient`] - Submission API (enqueue, status, result, cancel)
//! - [`TaskRegistry`] - Maps task names to handlers and retry policies
//! - [`TaskWorker`] - Long-running loop that claims and executes tasks
//! - [`PostgresTaskStore`] - Database-backed [`TaskStore`]
//! - [`Reaper`] - Returns rows held by dead workers to the queue
//! - [`Celery`] - Thin `delay` / `apply_async` facade over the client
//!
//! # Architecture
//!
//! ```text
//! Producer calls client.enqueue(name, args, kwargs)
//!     │
//!     └─► INSERT tasks (status = pending)
//!
//! TaskWorker (one loop per slot)
//!     │
//!     ├─► Claim one row (FOR UPDATE SKIP LOCKED, status → running)
//!     ├─► Look up handler (TaskRegistry)
//!     ├─► Run handler in its own task (panics are captured)
//!     └─► Record outcome: success | failure | pending again after backoff
//! ```

pub mod client;
pub mod compat;
pub mod reaper;
pub mod registry;
pub mod retry;
pub mod store;
pub mod task;
pub mod testing;
pub mod worker;

pub use client::{ClientConfig, EnqueueOptions, TaskClient, TaskHandle};
pub use compat::{ApplyOptions, AsyncResult, Celery, Signature};
pub use reaper::Reaper;
pub use registry::{RegisteredTask, TaskInvocation, TaskRegistry};
pub use retry::RetryPolicy;
pub use store::{Outcome, PostgresTaskStore, QueueStats, ReapReport, TaskStore};
pub use task::{ErrorKind, NonRetryable, Task, TaskError, TaskStatus};
pub use testing::MemoryTaskStore;
pub use worker::{TaskWorker, WorkerConfig};
