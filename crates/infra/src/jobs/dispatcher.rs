//! Dispatcher: one scheduling cycle over the job store.
//!
//! A cycle runs in three steps:
//!
//! 1. Recover orphans: `Running` jobs untouched for longer than the staleness
//!    timeout are claimed and put through the same failure handling as a
//!    failed attempt.
//! 2. Fetch the batch: `Pending` jobs unioned with retry-eligible `Failed`
//!    jobs, ordered by `(created_at, id)`. Requeued jobs still inside their
//!    backoff delay are skipped for this cycle and do not use up batch slots.
//! 3. Claim each job in order and hand it to a bounded worker pool. A worker
//!    resolves the executor, runs it under the execution timeout and records
//!    the outcome.
//!
//! Claims are compare-and-set in the store, so two dispatchers racing over the
//! same row never both execute it. A store error aborts the cycle once the
//! workers already started have finished; nothing is left half written.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinSet};
use tracing::{debug, error, info, warn};

use cadence_core::{JobRecord, JobStatus, RetryDecision, RetryPolicy};

use super::registry::{Executor, ExecutorRegistry};
use super::stats::DispatcherStats;
use super::store::{JobStore, JobStoreError};
use crate::config::EngineConfig;

/// Reason recorded on a job recovered from a crashed or hung worker.
pub const ORPHANED_REASON: &str = "orphaned: RUNNING past staleness timeout";

/// Error that aborts a dispatch cycle.
#[derive(Debug, thiserror::Error)]
pub enum DispatchError {
    #[error("job store error: {0}")]
    Store(#[from] JobStoreError),
    #[error("dispatch worker crashed: {0}")]
    Worker(String),
}

/// What happened to one job handed to a worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Completed,
    Requeued,
    Failed,
    /// No executor for the job type; failed without retry.
    Misconfigured,
}

/// Summary of one dispatch cycle.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct CycleReport {
    /// Orphaned `Running` jobs put back through failure handling
    pub recovered: usize,
    /// Jobs claimed and handed to a worker
    pub dispatched: usize,
    pub completed: usize,
    pub requeued: usize,
    pub failed: usize,
    pub misconfigured: usize,
    /// Jobs another dispatcher claimed first
    pub lost_claims: usize,
    /// Requeued jobs still inside their backoff delay
    pub deferred: usize,
}

impl CycleReport {
    fn record(&mut self, outcome: JobOutcome) {
        match outcome {
            JobOutcome::Completed => self.completed += 1,
            JobOutcome::Requeued => self.requeued += 1,
            JobOutcome::Failed => self.failed += 1,
            JobOutcome::Misconfigured => self.misconfigured += 1,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.recovered == 0 && self.dispatched == 0 && self.lost_claims == 0
    }
}

/// Claims due jobs and runs them through their executors.
pub struct Dispatcher<S: JobStore + ?Sized + 'static> {
    store: Arc<S>,
    registry: Arc<ExecutorRegistry>,
    policy: RetryPolicy,
    execution_timeout: Duration,
    staleness_timeout: Duration,
    batch_size: usize,
    max_concurrent: usize,
    stats: Arc<Mutex<DispatcherStats>>,
}

impl<S: JobStore + ?Sized + 'static> Clone for Dispatcher<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            registry: self.registry.clone(),
            policy: self.policy.clone(),
            execution_timeout: self.execution_timeout,
            staleness_timeout: self.staleness_timeout,
            batch_size: self.batch_size,
            max_concurrent: self.max_concurrent,
            stats: self.stats.clone(),
        }
    }
}

impl<S: JobStore + ?Sized + 'static> Dispatcher<S> {
    pub fn new(store: Arc<S>, registry: ExecutorRegistry, config: &EngineConfig) -> Self {
        Self {
            store,
            registry: Arc::new(registry),
            policy: config.retry_policy(),
            execution_timeout: config.execution_timeout,
            staleness_timeout: config.running_staleness_timeout,
            batch_size: config.batch_size.max(1),
            max_concurrent: config.max_concurrent.max(1),
            stats: Arc::new(Mutex::new(DispatcherStats::default())),
        }
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    pub fn policy(&self) -> &RetryPolicy {
        &self.policy
    }

    /// Snapshot of the counters accumulated over every cycle so far.
    pub fn stats(&self) -> DispatcherStats {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Run one full cycle and wait for every job it started.
    pub async fn run_cycle(&self) -> Result<CycleReport, DispatchError> {
        let result = self.cycle(Utc::now()).await;

        let mut stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
        stats.cycles += 1;
        match &result {
            Ok(report) => {
                stats.jobs_claimed += report.dispatched as u64;
                stats.jobs_completed += report.completed as u64;
                stats.jobs_requeued += report.requeued as u64;
                stats.jobs_failed += report.failed as u64;
                stats.jobs_misconfigured += report.misconfigured as u64;
                stats.lost_claims += report.lost_claims as u64;
                stats.recovered_stale += report.recovered as u64;
            }
            Err(_) => stats.aborted_cycles += 1,
        }
        drop(stats);

        if let Ok(report) = &result {
            if report.is_idle() {
                debug!(deferred = report.deferred, "dispatch cycle idle");
            } else {
                info!(
                    recovered = report.recovered,
                    dispatched = report.dispatched,
                    completed = report.completed,
                    requeued = report.requeued,
                    failed = report.failed,
                    misconfigured = report.misconfigured,
                    lost_claims = report.lost_claims,
                    deferred = report.deferred,
                    "dispatch cycle finished"
                );
            }
        }
        result
    }

    async fn cycle(&self, now: DateTime<Utc>) -> Result<CycleReport, DispatchError> {
        let mut report = CycleReport::default();

        report.recovered = self.recover_stale(now).await?;

        let (batch, deferred) = self.fetch_batch(Utc::now()).await?;
        report.deferred = deferred;

        let permits = Arc::new(Semaphore::new(self.max_concurrent));
        let mut workers = JoinSet::new();
        let mut aborted = None;

        for job in batch {
            let Ok(permit) = permits.clone().acquire_owned().await else {
                break;
            };

            let claimed = match self.store.claim(&job).await {
                Ok(Some(claimed)) => claimed,
                Ok(None) => {
                    debug!(job_id = %job.id, job_type = %job.job_type, "claim lost to another dispatcher");
                    report.lost_claims += 1;
                    continue;
                }
                Err(err) => {
                    aborted = Some(DispatchError::Store(err));
                    break;
                }
            };

            report.dispatched += 1;
            self.adjust_running(1);

            let worker = self.clone();
            workers.spawn(async move {
                let outcome = worker.process(claimed).await;
                worker.adjust_running(-1);
                drop(permit);
                outcome
            });
        }

        while let Some(joined) = workers.join_next().await {
            match joined {
                Ok(Ok(outcome)) => report.record(outcome),
                Ok(Err(err)) => {
                    error!(error = %err, "failed to record job outcome");
                    aborted.get_or_insert(DispatchError::Store(err));
                }
                Err(err) => {
                    error!(error = %err, "dispatch worker crashed");
                    aborted.get_or_insert(DispatchError::Worker(err.to_string()));
                }
            }
        }

        match aborted {
            Some(err) => Err(err),
            None => Ok(report),
        }
    }

    /// Claim `Running` jobs past the staleness timeout and treat each as a
    /// failed attempt.
    async fn recover_stale(&self, now: DateTime<Utc>) -> Result<usize, JobStoreError> {
        let cutoff = chrono::Duration::from_std(self.staleness_timeout)
            .ok()
            .and_then(|timeout| now.checked_sub_signed(timeout))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);

        let stale = self.store.list_stale_running(cutoff, self.batch_size).await?;
        let mut recovered = 0;
        for job in stale {
            let Some(claimed) = self.store.claim(&job).await? else {
                continue;
            };
            warn!(
                job_id = %claimed.id,
                job_type = %claimed.job_type,
                retry_count = claimed.retry_count,
                last_touched = %job.updated_at,
                "recovering orphaned job"
            );
            self.handle_failure(&claimed, ORPHANED_REASON).await?;
            recovered += 1;
        }
        Ok(recovered)
    }

    /// Runnable jobs in dispatch order, and how many were held back by backoff.
    ///
    /// Deferred rows sort ahead of newer jobs, so the fetch widens until it
    /// finds a full batch of due jobs or runs out of rows.
    async fn fetch_batch(&self, now: DateTime<Utc>) -> Result<(Vec<JobRecord>, usize), JobStoreError> {
        let mut limit = self.batch_size;
        loop {
            let pending = self.store.list_pending(limit).await?;
            let failed = self
                .store
                .list_failed_eligible_for_retry(self.policy.max_retries, limit)
                .await?;
            let drained = pending.len() < limit && failed.len() < limit;

            let mut batch = pending;
            batch.extend(failed);
            batch.sort_by_key(JobRecord::dispatch_key);

            let before = batch.len();
            batch.retain(|job| self.is_due(job, now));
            let deferred = before - batch.len();

            if batch.len() >= self.batch_size || drained {
                batch.truncate(self.batch_size);
                return Ok((batch, deferred));
            }
            limit = self.batch_size.saturating_add(deferred);
        }
    }

    fn is_due(&self, job: &JobRecord, now: DateTime<Utc>) -> bool {
        job.status != JobStatus::Pending
            || self.policy.delay_for_retry(job.retry_count).is_zero()
            || self.policy.ready_at(job.updated_at, job.retry_count) <= now
    }

    /// Run a claimed job and record how it ended.
    async fn process(&self, job: JobRecord) -> Result<JobOutcome, JobStoreError> {
        let executor = match self.registry.resolve(&job.job_type) {
            Ok(executor) => executor,
            Err(err) => {
                error!(
                    job_id = %job.id,
                    job_type = %job.job_type,
                    "no executor registered for job type; failing job without retry"
                );
                self.store.fail(job.id, job.retry_count, &err.to_string()).await?;
                return Ok(JobOutcome::Misconfigured);
            }
        };

        debug!(job_id = %job.id, job_type = %job.job_type, retry_count = job.retry_count, "executing job");

        match self.execute(executor, &job).await {
            Ok(()) => {
                self.store
                    .update_status(job.id, JobStatus::Completed, job.retry_count)
                    .await?;
                debug!(job_id = %job.id, job_type = %job.job_type, "job completed");
                Ok(JobOutcome::Completed)
            }
            Err(reason) => self.handle_failure(&job, &reason).await,
        }
    }

    /// Run the executor on its own task so a panic or a hang stays contained.
    ///
    /// On timeout the task is aborted and awaited before the failure is
    /// recorded, so a requeued job never overlaps its previous attempt.
    async fn execute(&self, executor: Arc<dyn Executor>, job: &JobRecord) -> Result<(), String> {
        let payload = job.payload.clone();
        let mut task = tokio::spawn(async move { executor.execute(&payload).await });

        let finished = tokio::time::timeout(self.execution_timeout, &mut task).await;
        match finished {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(err))) => Err(format!("{err:#}")),
            Ok(Err(join_err)) => Err(join_error_reason(join_err)),
            Err(_) => {
                task.abort();
                if let Err(join_err) = task.await {
                    if join_err.is_panic() {
                        warn!(job_id = %job.id, "executor panicked while being cancelled");
                    }
                }
                Err(format!(
                    "execution timed out after {}ms",
                    self.execution_timeout.as_millis()
                ))
            }
        }
    }

    async fn handle_failure(&self, job: &JobRecord, reason: &str) -> Result<JobOutcome, JobStoreError> {
        match self.policy.decide(job.retry_count) {
            RetryDecision::Requeue { retry_count } => {
                info!(
                    job_id = %job.id,
                    job_type = %job.job_type,
                    retry_count,
                    error = reason,
                    "job attempt failed; requeued"
                );
                self.store.requeue(job.id, retry_count, reason).await?;
                Ok(JobOutcome::Requeued)
            }
            RetryDecision::Exhausted { retry_count } => {
                warn!(
                    job_id = %job.id,
                    job_type = %job.job_type,
                    retry_count,
                    error = reason,
                    "job failed after exhausting retries"
                );
                self.store.fail(job.id, retry_count, reason).await?;
                Ok(JobOutcome::Failed)
            }
        }
    }

    fn adjust_running(&self, delta: isize) {
        let mut stats = self.stats.lock().unwrap_or_else(PoisonError::into_inner);
        stats.current_running = stats.current_running.saturating_add_signed(delta);
    }
}

fn join_error_reason(err: JoinError) -> String {
    if !err.is_panic() {
        return "executor task was cancelled".to_string();
    }
    let panic = err.into_panic();
    let message = panic
        .downcast_ref::<&str>()
        .map(|s| (*s).to_string())
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "non-string panic payload".to_string());
    format!("executor panicked: {message}")
}
