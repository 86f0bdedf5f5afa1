//! Job record storage.

use std::collections::HashMap;
use std::sync::{Arc, PoisonError, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use cadence_core::{JobId, JobRecord, JobStatus};

/// Durable access to job records.
///
/// Every operation is a single atomic write or read: a failed call leaves no
/// partially updated record behind. `claim` is the only compare-and-set and is
/// what guarantees at most one concurrent execution per job.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a new `Pending` record with `retry_count = 0`.
    async fn insert(&self, job_type: &str, payload: &str) -> Result<JobRecord, JobStoreError>;

    /// Get a job by ID.
    async fn get(&self, id: JobId) -> Result<Option<JobRecord>, JobStoreError>;

    /// `Pending` jobs, oldest first (`created_at`, then `id`).
    async fn list_pending(&self, limit: usize) -> Result<Vec<JobRecord>, JobStoreError>;

    /// Non-terminal `Failed` jobs with `retry_count < max_retries`, oldest first.
    async fn list_failed_eligible_for_retry(
        &self,
        max_retries: u32,
        limit: usize,
    ) -> Result<Vec<JobRecord>, JobStoreError>;

    /// `Running` jobs last touched before `cutoff`, oldest first.
    async fn list_stale_running(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<JobRecord>, JobStoreError>;

    /// Move `job` to `Running` if the stored row still has the `status` and
    /// `updated_at` the caller observed.
    ///
    /// Returns the claimed record, or `None` when another worker got there first.
    async fn claim(&self, job: &JobRecord) -> Result<Option<JobRecord>, JobStoreError>;

    /// Overwrite status and retry count. Clears the terminal marker; completing a
    /// job also clears `last_error`.
    async fn update_status(
        &self,
        id: JobId,
        status: JobStatus,
        retry_count: u32,
    ) -> Result<(), JobStoreError>;

    /// Put a failed job back to `Pending` for another attempt.
    async fn requeue(&self, id: JobId, retry_count: u32, reason: &str)
    -> Result<(), JobStoreError>;

    /// Fail a job terminally. It is never retried again.
    async fn fail(&self, id: JobId, retry_count: u32, reason: &str) -> Result<(), JobStoreError>;

    /// Number of jobs currently in `status`.
    async fn count_by_status(&self, status: JobStatus) -> Result<u64, JobStoreError>;

    /// Number of `Pending`/`Running` jobs created before `cutoff`.
    async fn count_unfinished_before(&self, cutoff: DateTime<Utc>) -> Result<u64, JobStoreError>;

    /// Delete every job created before `cutoff`, whatever its status.
    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, JobStoreError>;
}

/// Job store error.
#[derive(Debug, Clone, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("storage error: {0}")]
    Storage(String),
    #[error("corrupt job record: {0}")]
    Corrupt(String),
}

/// In-memory job store for tests/dev.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: RwLock<HashMap<JobId, JobRecord>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Insert a fully formed record as-is (imports, fixtures).
    pub fn insert_record(&self, job: JobRecord) -> Result<JobId, JobStoreError> {
        let mut jobs = self.jobs.write().unwrap_or_else(PoisonError::into_inner);
        if jobs.contains_key(&job.id) {
            return Err(JobStoreError::AlreadyExists(job.id));
        }
        let id = job.id;
        jobs.insert(id, job);
        Ok(id)
    }

    /// Snapshot of every stored record, in dispatch order.
    pub fn all(&self) -> Vec<JobRecord> {
        self.select(|_| true, usize::MAX)
    }

    fn select(&self, filter: impl Fn(&JobRecord) -> bool, limit: usize) -> Vec<JobRecord> {
        let jobs = self.jobs.read().unwrap_or_else(PoisonError::into_inner);
        let mut result: Vec<_> = jobs.values().filter(|j| filter(j)).cloned().collect();
        result.sort_by_key(JobRecord::dispatch_key);
        result.truncate(limit);
        result
    }

    fn modify(&self, id: JobId, f: impl FnOnce(&mut JobRecord)) -> Result<(), JobStoreError> {
        let mut jobs = self.jobs.write().unwrap_or_else(PoisonError::into_inner);
        let job = jobs.get_mut(&id).ok_or(JobStoreError::NotFound(id))?;
        f(job);
        job.updated_at = Utc::now();
        Ok(())
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn insert(&self, job_type: &str, payload: &str) -> Result<JobRecord, JobStoreError> {
        let job = JobRecord::new(job_type, payload);
        self.insert_record(job.clone())?;
        Ok(job)
    }

    async fn get(&self, id: JobId) -> Result<Option<JobRecord>, JobStoreError> {
        let jobs = self.jobs.read().unwrap_or_else(PoisonError::into_inner);
        Ok(jobs.get(&id).cloned())
    }

    async fn list_pending(&self, limit: usize) -> Result<Vec<JobRecord>, JobStoreError> {
        Ok(self.select(|j| j.status == JobStatus::Pending, limit))
    }

    async fn list_failed_eligible_for_retry(
        &self,
        max_retries: u32,
        limit: usize,
    ) -> Result<Vec<JobRecord>, JobStoreError> {
        Ok(self.select(
            |j| j.status == JobStatus::Failed && !j.terminal && j.retry_count < max_retries,
            limit,
        ))
    }

    async fn list_stale_running(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<JobRecord>, JobStoreError> {
        Ok(self.select(
            |j| j.status == JobStatus::Running && j.updated_at < cutoff,
            limit,
        ))
    }

    async fn claim(&self, job: &JobRecord) -> Result<Option<JobRecord>, JobStoreError> {
        let mut jobs = self.jobs.write().unwrap_or_else(PoisonError::into_inner);
        match jobs.get_mut(&job.id) {
            Some(current)
                if current.status == job.status && current.updated_at == job.updated_at =>
            {
                current.status = JobStatus::Running;
                current.updated_at = Utc::now();
                Ok(Some(current.clone()))
            }
            _ => Ok(None),
        }
    }

    async fn update_status(
        &self,
        id: JobId,
        status: JobStatus,
        retry_count: u32,
    ) -> Result<(), JobStoreError> {
        self.modify(id, |job| {
            job.status = status;
            job.retry_count = retry_count;
            job.terminal = false;
            if status == JobStatus::Completed {
                job.last_error = None;
            }
        })
    }

    async fn requeue(
        &self,
        id: JobId,
        retry_count: u32,
        reason: &str,
    ) -> Result<(), JobStoreError> {
        self.modify(id, |job| {
            job.status = JobStatus::Pending;
            job.retry_count = retry_count;
            job.terminal = false;
            job.last_error = Some(reason.to_string());
        })
    }

    async fn fail(&self, id: JobId, retry_count: u32, reason: &str) -> Result<(), JobStoreError> {
        self.modify(id, |job| {
            job.status = JobStatus::Failed;
            job.retry_count = retry_count;
            job.terminal = true;
            job.last_error = Some(reason.to_string());
        })
    }

    async fn count_by_status(&self, status: JobStatus) -> Result<u64, JobStoreError> {
        let jobs = self.jobs.read().unwrap_or_else(PoisonError::into_inner);
        Ok(jobs.values().filter(|j| j.status == status).count() as u64)
    }

    async fn count_unfinished_before(&self, cutoff: DateTime<Utc>) -> Result<u64, JobStoreError> {
        let jobs = self.jobs.read().unwrap_or_else(PoisonError::into_inner);
        Ok(jobs
            .values()
            .filter(|j| j.created_at < cutoff && j.status.is_unfinished())
            .count() as u64)
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, JobStoreError> {
        let mut jobs = self.jobs.write().unwrap_or_else(PoisonError::into_inner);
        let before = jobs.len();
        jobs.retain(|_, j| j.created_at >= cutoff);
        Ok((before - jobs.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[tokio::test]
    async fn insert_creates_pending_record() {
        let store = InMemoryJobStore::new();

        let job = store.insert("SEND_DIGEST", r#"{"user":7}"#).await.unwrap();

        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.retry_count, 0);
        assert_eq!(store.get(job.id).await.unwrap(), Some(job));
    }

    #[tokio::test]
    async fn list_pending_is_oldest_first() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();

        let newer = JobRecord::new("A", "").created_at(now);
        let older = JobRecord::new("A", "").created_at(now - Duration::minutes(5));
        store.insert_record(newer.clone()).unwrap();
        store.insert_record(older.clone()).unwrap();

        let pending = store.list_pending(10).await.unwrap();
        let ids: Vec<_> = pending.iter().map(|j| j.id).collect();
        assert_eq!(ids, vec![older.id, newer.id]);

        assert_eq!(store.list_pending(1).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn claim_is_compare_and_set() {
        let store = InMemoryJobStore::new();
        let job = store.insert("A", "").await.unwrap();

        let claimed = store.claim(&job).await.unwrap().unwrap();
        assert_eq!(claimed.status, JobStatus::Running);

        // Second claim from the same stale observation loses.
        assert!(store.claim(&job).await.unwrap().is_none());
        assert_eq!(store.count_by_status(JobStatus::Running).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn claim_of_deleted_job_is_lost() {
        let store = InMemoryJobStore::new();
        let job = store.insert("A", "").await.unwrap();
        store
            .delete_older_than(Utc::now() + Duration::seconds(1))
            .await
            .unwrap();

        assert!(store.claim(&job).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn failed_eligibility_excludes_terminal_and_exhausted() {
        let store = InMemoryJobStore::new();
        let retryable = store.insert("A", "").await.unwrap();
        let exhausted = store.insert("A", "").await.unwrap();
        let terminal = store.insert("A", "").await.unwrap();

        store
            .update_status(retryable.id, JobStatus::Failed, 1)
            .await
            .unwrap();
        store
            .update_status(exhausted.id, JobStatus::Failed, 3)
            .await
            .unwrap();
        store.fail(terminal.id, 0, "no executor").await.unwrap();

        let eligible = store.list_failed_eligible_for_retry(3, 10).await.unwrap();
        let ids: Vec<_> = eligible.iter().map(|j| j.id).collect();
        assert_eq!(ids, vec![retryable.id]);
    }

    #[tokio::test]
    async fn requeue_and_complete_track_last_error() {
        let store = InMemoryJobStore::new();
        let job = store.insert("A", "").await.unwrap();

        store.requeue(job.id, 1, "smtp timeout").await.unwrap();
        let requeued = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(requeued.status, JobStatus::Pending);
        assert_eq!(requeued.retry_count, 1);
        assert_eq!(requeued.last_error.as_deref(), Some("smtp timeout"));

        store
            .update_status(job.id, JobStatus::Completed, 1)
            .await
            .unwrap();
        let completed = store.get(job.id).await.unwrap().unwrap();
        assert_eq!(completed.last_error, None);
        assert!(completed.updated_at >= requeued.updated_at);
    }

    #[tokio::test]
    async fn updates_of_unknown_job_are_not_found() {
        let store = InMemoryJobStore::new();
        let id = JobId::new();

        assert!(matches!(
            store.update_status(id, JobStatus::Completed, 0).await,
            Err(JobStoreError::NotFound(missing)) if missing == id
        ));
        assert!(matches!(
            store.fail(id, 0, "x").await,
            Err(JobStoreError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn stale_running_uses_updated_at() {
        let store = InMemoryJobStore::new();
        let long_ago = Utc::now() - Duration::hours(1);

        let mut stale = JobRecord::new("A", "").created_at(long_ago);
        stale.status = JobStatus::Running;
        store.insert_record(stale.clone()).unwrap();

        let fresh = store.insert("A", "").await.unwrap();
        store.claim(&fresh).await.unwrap().unwrap();

        let cutoff = Utc::now() - Duration::minutes(15);
        let found = store.list_stale_running(cutoff, 10).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].id, stale.id);
    }

    #[tokio::test]
    async fn unfinished_count_before_cutoff() {
        let store = InMemoryJobStore::new();
        let old = Utc::now() - Duration::days(40);

        store
            .insert_record(JobRecord::new("A", "").created_at(old))
            .unwrap();
        let mut done = JobRecord::new("A", "").created_at(old);
        done.status = JobStatus::Completed;
        store.insert_record(done).unwrap();
        store.insert("A", "").await.unwrap();

        let cutoff = Utc::now() - Duration::days(30);
        assert_eq!(store.count_unfinished_before(cutoff).await.unwrap(), 1);
    }

    #[test]
    fn duplicate_record_is_rejected() {
        let store = InMemoryJobStore::new();
        let job = JobRecord::new("A", "");
        store.insert_record(job.clone()).unwrap();

        assert!(matches!(
            store.insert_record(job),
            Err(JobStoreError::AlreadyExists(_))
        ));
    }
}
