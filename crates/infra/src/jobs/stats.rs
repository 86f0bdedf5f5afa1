//! Queue depth and dispatcher runtime statistics.

use cadence_core::JobStatus;

use super::store::{JobStore, JobStoreError};

/// Dispatcher runtime statistics (since process start).
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct DispatcherStats {
    pub cycles: u64,
    pub aborted_cycles: u64,
    pub jobs_claimed: u64,
    pub jobs_completed: u64,
    pub jobs_requeued: u64,
    pub jobs_failed: u64,
    pub jobs_misconfigured: u64,
    pub lost_claims: u64,
    pub recovered_stale: u64,
    pub current_running: usize,
}

/// Number of jobs per status, as reported by the store.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, serde::Serialize)]
pub struct QueueDepth {
    pub pending: u64,
    pub running: u64,
    pub completed: u64,
    pub failed: u64,
}

impl QueueDepth {
    /// Query `count_by_status` for every status.
    pub async fn collect<S: JobStore + ?Sized>(store: &S) -> Result<Self, JobStoreError> {
        Ok(Self {
            pending: store.count_by_status(JobStatus::Pending).await?,
            running: store.count_by_status(JobStatus::Running).await?,
            completed: store.count_by_status(JobStatus::Completed).await?,
            failed: store.count_by_status(JobStatus::Failed).await?,
        })
    }

    pub fn total(&self) -> u64 {
        self.pending + self.running + self.completed + self.failed
    }
}
