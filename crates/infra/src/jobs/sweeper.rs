//! Retention sweeper: purges job records older than the retention window.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tracing::{info, warn};

use super::store::{JobStore, JobStoreError};

/// Result of one sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
pub struct SweepReport {
    pub cutoff: DateTime<Utc>,
    /// Records deleted
    pub removed: u64,
    /// `Pending`/`Running` records among them
    pub unfinished: u64,
}

/// Deletes records of any status created before `now - retention_window`.
pub struct RetentionSweeper<S: JobStore + ?Sized> {
    store: Arc<S>,
    retention_window: Duration,
}

impl<S: JobStore + ?Sized> RetentionSweeper<S> {
    pub fn new(store: Arc<S>, retention_window: Duration) -> Self {
        Self {
            store,
            retention_window,
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn retention_window(&self) -> Duration {
        self.retention_window
    }

    pub async fn sweep(&self) -> Result<SweepReport, JobStoreError> {
        self.sweep_at(Utc::now()).await
    }

    /// Sweep as if the current time were `now`.
    ///
    /// Unfinished records past the cutoff are deleted too, but reported as an
    /// anomaly: the dispatcher is falling behind or their job type was removed.
    pub async fn sweep_at(&self, now: DateTime<Utc>) -> Result<SweepReport, JobStoreError> {
        let cutoff = chrono::Duration::from_std(self.retention_window)
            .ok()
            .and_then(|window| now.checked_sub_signed(window))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let unfinished = self.store.count_unfinished_before(cutoff).await?;
        if unfinished > 0 {
            warn!(
                %cutoff,
                unfinished,
                "retention sweep is deleting jobs that never finished"
            );
        }

        let removed = self.store.delete_older_than(cutoff).await?;
        info!(%cutoff, removed, "retention sweep finished");

        Ok(SweepReport {
            cutoff,
            removed,
            unfinished,
        })
    }
}
