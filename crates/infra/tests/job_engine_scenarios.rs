//! End-to-end behaviour of the dispatcher, retry handling and retention over
//! the in-memory store.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use cadence_core::{JobId, JobRecord, JobStatus};
use cadence_infra::EngineConfig;
use cadence_infra::jobs::{
    DispatchError, Dispatcher, ExecutorRegistry, InMemoryJobStore, JobProducer, JobStore,
    JobStoreError, RetentionSweeper,
};

fn config(max_retries: u32) -> EngineConfig {
    EngineConfig::default().with_max_retries(max_retries)
}

/// Executor that counts its invocations and fails the first `failures` of them.
fn counting(failures: usize) -> (Arc<AtomicUsize>, ExecutorRegistry) {
    let calls = Arc::new(AtomicUsize::new(0));
    let seen = calls.clone();
    let registry = ExecutorRegistry::new()
        .with("SEND_DIGEST", move |_payload: String| {
            let attempt = seen.fetch_add(1, Ordering::SeqCst) + 1;
            async move {
                if attempt <= failures {
                    anyhow::bail!("smtp unavailable (attempt {attempt})");
                }
                Ok(())
            }
        })
        .unwrap();
    (calls, registry)
}

async fn stored(store: &InMemoryJobStore, id: JobId) -> JobRecord {
    store.get(id).await.unwrap().unwrap()
}

#[tokio::test]
async fn scenario_succeeding_job_completes_after_one_cycle() {
    let store = InMemoryJobStore::arc();
    let (calls, registry) = counting(0);
    let dispatcher = Dispatcher::new(store.clone(), registry, &config(3));

    let job = JobProducer::new(store.clone())
        .submit("SEND_DIGEST", r#"{"user":"u-1"}"#)
        .await
        .unwrap();
    dispatcher.run_cycle().await.unwrap();

    let job = stored(&store, job.id).await;
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.retry_count, 0);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn scenario_always_failing_job_fails_after_four_attempts() {
    let store = InMemoryJobStore::arc();
    let (calls, registry) = counting(usize::MAX);
    let dispatcher = Dispatcher::new(store.clone(), registry, &config(3));

    let job = store.insert("SEND_DIGEST", "{}").await.unwrap();

    for cycle in 1..=4 {
        dispatcher.run_cycle().await.unwrap();
        let current = stored(&store, job.id).await;
        if cycle < 4 {
            assert_eq!(current.status, JobStatus::Pending, "cycle {cycle}");
            assert_eq!(current.retry_count, cycle as u32);
        }
    }

    let failed = stored(&store, job.id).await;
    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(failed.retry_count, 3);
    assert!(failed.terminal);
    assert_eq!(
        failed.last_error.as_deref(),
        Some("smtp unavailable (attempt 4)")
    );

    let report = dispatcher.run_cycle().await.unwrap();
    assert_eq!(report.dispatched, 0);
    assert_eq!(calls.load(Ordering::SeqCst), 4);
    assert_eq!(stored(&store, job.id).await, failed);
}

#[tokio::test]
async fn scenario_job_failing_twice_then_succeeding_completes() {
    let store = InMemoryJobStore::arc();
    let (calls, registry) = counting(2);
    let dispatcher = Dispatcher::new(store.clone(), registry, &config(3));

    let job = store.insert("SEND_DIGEST", "{}").await.unwrap();
    for _ in 0..5 {
        dispatcher.run_cycle().await.unwrap();
    }

    let job = stored(&store, job.id).await;
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.retry_count, 2);
    assert_eq!(job.last_error, None);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn scenario_unregistered_job_type_fails_without_retry() {
    let store = InMemoryJobStore::arc();
    let (calls, registry) = counting(0);
    let dispatcher = Dispatcher::new(store.clone(), registry, &config(3));

    let job = store.insert("DEADLINE_REMINDER", "{}").await.unwrap();
    let report = dispatcher.run_cycle().await.unwrap();
    assert_eq!(report.misconfigured, 1);

    let failed = stored(&store, job.id).await;
    assert_eq!(failed.status, JobStatus::Failed);
    assert_eq!(failed.retry_count, 0);

    for _ in 0..3 {
        assert_eq!(dispatcher.run_cycle().await.unwrap().dispatched, 0);
    }
    assert_eq!(stored(&store, job.id).await, failed);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn scenario_stale_running_job_is_recovered() {
    let store = InMemoryJobStore::arc();
    let (calls, registry) = counting(0);
    let config = config(3);
    let dispatcher = Dispatcher::new(store.clone(), registry, &config);

    let mut orphan = JobRecord::new("SEND_DIGEST", "{}")
        .created_at(Utc::now() - chrono::Duration::hours(1));
    orphan.status = JobStatus::Running;
    let id = store.insert_record(orphan).unwrap();

    let report = dispatcher.run_cycle().await.unwrap();
    assert_eq!(report.recovered, 1);
    assert_eq!(report.completed, 1);

    let job = stored(&store, id).await;
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.retry_count, 1);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn fresh_running_job_is_left_alone() {
    let store = InMemoryJobStore::arc();
    let (calls, registry) = counting(0);
    let dispatcher = Dispatcher::new(store.clone(), registry, &config(3));

    let mut running = JobRecord::new("SEND_DIGEST", "{}");
    running.status = JobStatus::Running;
    let id = store.insert_record(running).unwrap();

    let report = dispatcher.run_cycle().await.unwrap();
    assert_eq!(report.recovered, 0);
    assert_eq!(stored(&store, id).await.status, JobStatus::Running);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn stale_job_with_exhausted_retries_fails_terminally() {
    let store = InMemoryJobStore::arc();
    let (calls, registry) = counting(0);
    let dispatcher = Dispatcher::new(store.clone(), registry, &config(3));

    let mut orphan = JobRecord::new("SEND_DIGEST", "{}")
        .created_at(Utc::now() - chrono::Duration::hours(1));
    orphan.status = JobStatus::Running;
    orphan.retry_count = 3;
    let id = store.insert_record(orphan).unwrap();

    dispatcher.run_cycle().await.unwrap();

    let job = stored(&store, id).await;
    assert_eq!(job.status, JobStatus::Failed);
    assert_eq!(job.retry_count, 3);
    assert!(job.terminal);
    assert_eq!(calls.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn scenario_delete_older_than_removes_only_older_job() {
    let store = InMemoryJobStore::new();
    let cutoff = Utc::now() - chrono::Duration::days(30);

    let mut old = JobRecord::new("CLEANUP", "").created_at(cutoff - chrono::Duration::seconds(1));
    old.status = JobStatus::Pending;
    store.insert_record(old).unwrap();
    let young = store
        .insert_record(JobRecord::new("CLEANUP", "").created_at(cutoff + chrono::Duration::seconds(1)))
        .unwrap();

    assert_eq!(store.delete_older_than(cutoff).await.unwrap(), 1);
    let remaining: Vec<_> = store.all().into_iter().map(|j| j.id).collect();
    assert_eq!(remaining, vec![young]);
}

#[tokio::test]
async fn retention_ignores_status() {
    let store = InMemoryJobStore::arc();
    let now = Utc::now();
    for status in JobStatus::ALL {
        let mut job = JobRecord::new("CLEANUP", "").created_at(now - chrono::Duration::days(60));
        job.status = status;
        store.insert_record(job).unwrap();
    }

    let report = RetentionSweeper::new(store.clone(), Duration::from_secs(30 * 24 * 60 * 60))
        .sweep_at(now)
        .await
        .unwrap();

    assert_eq!(report.removed, 4);
    assert_eq!(report.unfinished, 2);
}

#[tokio::test]
async fn identical_submissions_are_not_deduplicated() {
    let store = InMemoryJobStore::arc();
    let (calls, registry) = counting(0);
    let dispatcher = Dispatcher::new(store.clone(), registry, &config(3));
    let producer = JobProducer::new(store.clone());

    let first = producer.submit("SEND_DIGEST", "same").await.unwrap();
    let second = producer.submit("SEND_DIGEST", "same").await.unwrap();
    assert_ne!(first.id, second.id);

    dispatcher.run_cycle().await.unwrap();
    assert_eq!(calls.load(Ordering::SeqCst), 2);
    assert_eq!(store.count_by_status(JobStatus::Completed).await.unwrap(), 2);
}

#[tokio::test]
async fn operator_failed_job_is_retried() {
    let store = InMemoryJobStore::arc();
    let (calls, registry) = counting(0);
    let dispatcher = Dispatcher::new(store.clone(), registry, &config(3));

    let job = store.insert("SEND_DIGEST", "{}").await.unwrap();
    store.update_status(job.id, JobStatus::Failed, 1).await.unwrap();

    let report = dispatcher.run_cycle().await.unwrap();
    assert_eq!(report.completed, 1);

    let job = stored(&store, job.id).await;
    assert_eq!(job.status, JobStatus::Completed);
    assert_eq!(job.retry_count, 1);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn concurrent_claims_on_same_job_have_one_winner() {
    let store = InMemoryJobStore::arc();
    let job = store.insert("SEND_DIGEST", "{}").await.unwrap();

    let (a, b) = tokio::join!(store.claim(&job), store.claim(&job));
    let winners = [a.unwrap(), b.unwrap()].into_iter().flatten().count();

    assert_eq!(winners, 1);
    assert_eq!(stored(&store, job.id).await.status, JobStatus::Running);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn racing_dispatchers_execute_each_job_once() {
    let store = InMemoryJobStore::arc();
    let executions: Arc<Mutex<HashMap<String, usize>>> = Arc::default();
    let seen = executions.clone();
    let registry = ExecutorRegistry::new()
        .with("SEND_DIGEST", move |payload: String| {
            let seen = seen.clone();
            async move {
                *seen.lock().unwrap().entry(payload).or_default() += 1;
                tokio::task::yield_now().await;
                anyhow::Ok(())
            }
        })
        .unwrap();

    for i in 0..50 {
        store.insert("SEND_DIGEST", &format!("job-{i}")).await.unwrap();
    }

    let config = config(3).with_max_concurrent(4);
    let first = Dispatcher::new(store.clone(), registry.clone(), &config);
    let second = Dispatcher::new(store.clone(), registry, &config);

    let (a, b) = tokio::join!(first.run_cycle(), second.run_cycle());
    let (a, b) = (a.unwrap(), b.unwrap());

    assert_eq!(a.dispatched + b.dispatched, 50);
    let executions = executions.lock().unwrap();
    assert_eq!(executions.len(), 50);
    assert!(executions.values().all(|&count| count == 1));
}

/// Delegates to the in-memory store but can be switched to fail every read.
struct FlakyStore {
    inner: InMemoryJobStore,
    down: AtomicBool,
}

impl FlakyStore {
    fn check(&self) -> Result<(), JobStoreError> {
        if self.down.load(Ordering::SeqCst) {
            return Err(JobStoreError::Storage("connection refused".into()));
        }
        Ok(())
    }
}

#[async_trait]
impl JobStore for FlakyStore {
    async fn insert(&self, job_type: &str, payload: &str) -> Result<JobRecord, JobStoreError> {
        self.check()?;
        self.inner.insert(job_type, payload).await
    }

    async fn get(&self, id: JobId) -> Result<Option<JobRecord>, JobStoreError> {
        self.inner.get(id).await
    }

    async fn list_pending(&self, limit: usize) -> Result<Vec<JobRecord>, JobStoreError> {
        self.check()?;
        self.inner.list_pending(limit).await
    }

    async fn list_failed_eligible_for_retry(
        &self,
        max_retries: u32,
        limit: usize,
    ) -> Result<Vec<JobRecord>, JobStoreError> {
        self.check()?;
        self.inner.list_failed_eligible_for_retry(max_retries, limit).await
    }

    async fn list_stale_running(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<JobRecord>, JobStoreError> {
        self.check()?;
        self.inner.list_stale_running(cutoff, limit).await
    }

    async fn claim(&self, job: &JobRecord) -> Result<Option<JobRecord>, JobStoreError> {
        self.check()?;
        self.inner.claim(job).await
    }

    async fn update_status(
        &self,
        id: JobId,
        status: JobStatus,
        retry_count: u32,
    ) -> Result<(), JobStoreError> {
        self.check()?;
        self.inner.update_status(id, status, retry_count).await
    }

    async fn requeue(&self, id: JobId, retry_count: u32, reason: &str) -> Result<(), JobStoreError> {
        self.check()?;
        self.inner.requeue(id, retry_count, reason).await
    }

    async fn fail(&self, id: JobId, retry_count: u32, reason: &str) -> Result<(), JobStoreError> {
        self.check()?;
        self.inner.fail(id, retry_count, reason).await
    }

    async fn count_by_status(&self, status: JobStatus) -> Result<u64, JobStoreError> {
        self.check()?;
        self.inner.count_by_status(status).await
    }

    async fn count_unfinished_before(&self, cutoff: DateTime<Utc>) -> Result<u64, JobStoreError> {
        self.check()?;
        self.inner.count_unfinished_before(cutoff).await
    }

    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, JobStoreError> {
        self.check()?;
        self.inner.delete_older_than(cutoff).await
    }
}

#[tokio::test]
async fn storage_outage_aborts_cycle_without_touching_jobs() {
    let store = Arc::new(FlakyStore {
        inner: InMemoryJobStore::new(),
        down: AtomicBool::new(false),
    });
    let (calls, registry) = counting(0);
    let dispatcher = Dispatcher::new(store.clone(), registry, &config(3));

    let job = store.insert("SEND_DIGEST", "{}").await.unwrap();

    store.down.store(true, Ordering::SeqCst);
    let err = dispatcher.run_cycle().await.unwrap_err();
    assert!(matches!(err, DispatchError::Store(JobStoreError::Storage(_))));
    assert_eq!(store.get(job.id).await.unwrap().unwrap().status, JobStatus::Pending);
    assert_eq!(dispatcher.stats().aborted_cycles, 1);

    store.down.store(false, Ordering::SeqCst);
    dispatcher.run_cycle().await.unwrap();
    assert_eq!(store.get(job.id).await.unwrap().unwrap().status, JobStatus::Completed);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn dispatcher_works_over_a_trait_object_store() {
    let store: Arc<dyn JobStore> = InMemoryJobStore::arc();
    let (_, registry) = counting(0);
    let dispatcher = Dispatcher::new(store.clone(), registry, &config(3));

    let job = store.insert("SEND_DIGEST", "{}").await.unwrap();
    dispatcher.run_cycle().await.unwrap();

    assert_eq!(store.get(job.id).await.unwrap().unwrap().status, JobStatus::Completed);
}
