//! Producer API: how other subsystems enqueue work.

use std::sync::Arc;

use serde::Serialize;
use tokio::sync::Notify;
use tracing::debug;

use cadence_core::JobRecord;

use super::store::{JobStore, JobStoreError};

/// Typed submission error.
#[derive(Debug, thiserror::Error)]
pub enum SubmitError {
    #[error("failed to serialize job payload: {0}")]
    Serialization(#[from] serde_json::Error),
    #[error(transparent)]
    Store(#[from] JobStoreError),
}

/// Enqueues jobs into the store.
///
/// Submission never waits for execution; the outcome of a job is only visible
/// through its stored status. Identical submissions create independent
/// records.
pub struct JobProducer<S: JobStore + ?Sized> {
    store: Arc<S>,
    wake: Option<Arc<Notify>>,
}

impl<S: JobStore + ?Sized> Clone for JobProducer<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            wake: self.wake.clone(),
        }
    }
}

impl<S: JobStore + ?Sized> JobProducer<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self { store, wake: None }
    }

    /// Nudge a running engine after every submission instead of waiting for
    /// its next tick.
    pub fn with_wake(mut self, wake: Arc<Notify>) -> Self {
        self.wake = Some(wake);
        self
    }

    pub async fn submit(&self, job_type: &str, payload: &str) -> Result<JobRecord, JobStoreError> {
        let job = self.store.insert(job_type, payload).await?;
        debug!(job_id = %job.id, job_type, "job submitted");
        if let Some(wake) = &self.wake {
            wake.notify_one();
        }
        Ok(job)
    }

    /// Serialize `payload` as JSON and submit it.
    pub async fn submit_json<T: Serialize + ?Sized>(
        &self,
        job_type: &str,
        payload: &T,
    ) -> Result<JobRecord, SubmitError> {
        let payload = serde_json::to_string(payload)?;
        Ok(self.submit(job_type, &payload).await?)
    }
}
