// taskq - database-backed background task queue
//
// PostgreSQL is the queue, the lock coordinator and the result store.
// Producers enqueue through the submission client, workers claim rows with
// `FOR UPDATE SKIP LOCKED` and write the outcome back onto the same row.

pub mod config;
pub mod error;
pub mod jobs;

pub use config::*;
pub use error::{QueueError, Result};
