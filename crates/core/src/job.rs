//! Job record and status machine.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::CoreError;
use crate::id::JobId;

/// Job execution status.
///
/// Transitions driven by the dispatcher:
/// `Pending -> Running -> { Completed | Pending (retry) | Failed }`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum JobStatus {
    /// Queued, waiting to be claimed
    Pending,
    /// Claimed by a dispatcher worker
    Running,
    /// Completed successfully
    Completed,
    /// Failed; retry-eligible only while not terminal and under the retry bound
    Failed,
}

impl JobStatus {
    pub const ALL: [JobStatus; 4] = [
        JobStatus::Pending,
        JobStatus::Running,
        JobStatus::Completed,
        JobStatus::Failed,
    ];

    /// Persisted representation.
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "PENDING",
            JobStatus::Running => "RUNNING",
            JobStatus::Completed => "COMPLETED",
            JobStatus::Failed => "FAILED",
        }
    }

    /// `Pending` and `Running` records still represent outstanding work.
    pub fn is_unfinished(&self) -> bool {
        matches!(self, JobStatus::Pending | JobStatus::Running)
    }
}

impl core::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl core::str::FromStr for JobStatus {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "PENDING" => Ok(JobStatus::Pending),
            "RUNNING" => Ok(JobStatus::Running),
            "COMPLETED" => Ok(JobStatus::Completed),
            "FAILED" => Ok(JobStatus::Failed),
            other => Err(CoreError::unknown_status(other)),
        }
    }
}

/// A durable unit of background work.
///
/// `job_type` and `payload` are immutable after creation. The payload is opaque
/// to the engine and handed verbatim to the executor registered for `job_type`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    pub id: JobId,
    pub job_type: String,
    pub payload: String,
    pub status: JobStatus,
    /// Number of failed attempts that were requeued.
    pub retry_count: u32,
    /// Set when the engine failed the job for good. A terminal job is never
    /// retried, whatever its `retry_count`.
    pub terminal: bool,
    /// Message of the most recent failure, cleared on completion.
    pub last_error: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl JobRecord {
    /// Create a fresh `Pending` record.
    pub fn new(job_type: impl Into<String>, payload: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: JobId::new(),
            job_type: job_type.into(),
            payload: payload.into(),
            status: JobStatus::Pending,
            retry_count: 0,
            terminal: false,
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Override creation (and update) time, for imports and fixtures.
    pub fn created_at(mut self, at: DateTime<Utc>) -> Self {
        self.created_at = at;
        self.updated_at = at;
        self
    }

    /// Dispatch order: `created_at` ascending, ties broken by `id`.
    pub fn dispatch_key(&self) -> (DateTime<Utc>, JobId) {
        (self.created_at, self.id)
    }

    /// `Completed`, or `Failed` and marked terminal.
    pub fn is_settled(&self) -> bool {
        match self.status {
            JobStatus::Completed => true,
            JobStatus::Failed => self.terminal,
            JobStatus::Pending | JobStatus::Running => false,
        }
    }
}
