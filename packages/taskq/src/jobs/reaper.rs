//! Crash recovery for rows left RUNNING by a dead worker.
//!
//! A live worker refreshes `locked_at` on every heartbeat. A row whose lock
//! has not been refreshed for `stale_after` is assumed orphaned: it goes back
//! to PENDING, or to FAILURE with a `worker_lost` error when the lost attempt
//! was its last one. The attempt the dead worker consumed stays counted.
//!
//! `stale_after` must comfortably exceed the workers' heartbeat interval,
//! otherwise a slow but healthy worker loses its row and its outcome is
//! discarded by the lock fence.

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use super::store::{ReapReport, TaskStore};
use crate::error::Result;

pub struct Reaper {
    store: Arc<dyn TaskStore>,
    stale_after: Duration,
}

impl Reaper {
    pub fn new(store: Arc<dyn TaskStore>, stale_after: Duration) -> Self {
        Self { store, stale_after }
    }

    pub fn stale_after(&self) -> Duration {
        self.stale_after
    }

    /// One recovery pass.
    pub async fn reap_once(&self) -> Result<ReapReport> {
        let report = self.store.reap_stale(self.stale_after).await?;

        if !report.is_empty() {
            warn!(
                requeued = report.requeued.len(),
                failed = report.failed.len(),
                stale_after = ?self.stale_after,
                "recovered tasks from unresponsive workers"
            );
        }

        Ok(report)
    }

    /// Reap every `interval` until `shutdown` fires. Store errors are logged
    /// and the next pass runs on schedule.
    pub async fn run(self, interval: Duration, shutdown: CancellationToken) -> Result<()> {
        info!(interval = ?interval, stale_after = ?self.stale_after, "reaper starting");

        let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(e) = self.reap_once().await {
                        error!(error = %e, "reaper pass failed");
                    }
                }
            }
        }

        info!("reaper stopped");
        Ok(())
    }
}
