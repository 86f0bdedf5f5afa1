//! Postgres-backed job store.
//!
//! ## Atomicity
//!
//! Each operation is one SQL statement. The claim is an `UPDATE ... WHERE`
//! guarded by the status and `updated_at` the caller read, so two dispatchers
//! racing for the same row see exactly one `RETURNING` row between them.
//!
//! ## Error Mapping
//!
//! | SQLx Error | JobStoreError |
//! |------------|---------------|
//! | Database, code `23505` on `insert_record` | `AlreadyExists` |
//! | Database (other) | `Storage` |
//! | PoolClosed | `Storage` |
//! | Row decode failure | `Corrupt` |
//! | Other (I/O, TLS, timeouts) | `Storage` |

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tracing::instrument;
use uuid::Uuid;

use cadence_core::{JobId, JobRecord, JobStatus};

use super::store::{JobStore, JobStoreError};

const JOB_COLUMNS: &str =
    "id, job_type, payload, status, retry_count, terminal, last_error, created_at, updated_at";

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS background_jobs (
    id          UUID PRIMARY KEY,
    job_type    TEXT        NOT NULL,
    payload     TEXT        NOT NULL,
    status      TEXT        NOT NULL CHECK (status IN ('PENDING', 'RUNNING', 'COMPLETED', 'FAILED')),
    retry_count INTEGER     NOT NULL DEFAULT 0 CHECK (retry_count >= 0),
    terminal    BOOLEAN     NOT NULL DEFAULT FALSE,
    last_error  TEXT        NULL,
    created_at  TIMESTAMPTZ NOT NULL DEFAULT NOW(),
    updated_at  TIMESTAMPTZ NOT NULL DEFAULT NOW()
)
"#;

const INDEXES: [&str; 2] = [
    "CREATE INDEX IF NOT EXISTS background_jobs_dispatch_idx ON background_jobs (status, created_at, id)",
    "CREATE INDEX IF NOT EXISTS background_jobs_created_at_idx ON background_jobs (created_at)",
];

/// Postgres-backed job store.
///
/// Cheap to clone; all clones share the same connection pool.
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
}

impl PostgresJobStore {
    /// Create a new PostgresJobStore with the given connection pool.
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool: Arc::new(pool),
        }
    }

    /// Create the `background_jobs` table and its indexes if they do not exist.
    #[instrument(skip(self), err)]
    pub async fn ensure_schema(&self) -> Result<(), JobStoreError> {
        sqlx::query(SCHEMA)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("create_table", e))?;

        for index in INDEXES {
            sqlx::query(index)
                .execute(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("create_index", e))?;
        }
        Ok(())
    }

    /// Insert a fully formed record as-is (imports, fixtures).
    ///
    /// Returns the row as stored. Postgres keeps microseconds, so claims must
    /// use the returned record, not the one passed in.
    #[instrument(skip(self, job), fields(job_id = %job.id), err)]
    pub async fn insert_record(&self, job: &JobRecord) -> Result<JobRecord, JobStoreError> {
        let sql = format!(
            r#"
            INSERT INTO background_jobs (
                id, job_type, payload, status, retry_count,
                terminal, last_error, created_at, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            RETURNING {JOB_COLUMNS}
            "#
        );

        let row = sqlx::query_as::<_, JobRow>(&sql)
            .bind(job.id.as_uuid())
            .bind(&job.job_type)
            .bind(&job.payload)
            .bind(job.status.as_str())
            .bind(retry_count_param(job.retry_count)?)
            .bind(job.terminal)
            .bind(job.last_error.as_deref())
            .bind(job.created_at)
            .bind(job.updated_at)
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    JobStoreError::AlreadyExists(job.id)
                } else {
                    map_sqlx_error("insert_record", e)
                }
            })?;

        row.try_into()
    }

    async fn write(
        &self,
        operation: &str,
        id: JobId,
        query: sqlx::query::Query<'_, sqlx::Postgres, sqlx::postgres::PgArguments>,
    ) -> Result<(), JobStoreError> {
        let result = query
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error(operation, e))?;

        if result.rows_affected() == 0 {
            return Err(JobStoreError::NotFound(id));
        }
        Ok(())
    }
}

#[async_trait]
impl JobStore for PostgresJobStore {
    #[instrument(skip(self, payload), err)]
    async fn insert(&self, job_type: &str, payload: &str) -> Result<JobRecord, JobStoreError> {
        let sql = format!(
            r#"
            INSERT INTO background_jobs (id, job_type, payload, status, retry_count, terminal)
            VALUES ($1, $2, $3, 'PENDING', 0, FALSE)
            RETURNING {JOB_COLUMNS}
            "#
        );

        let row = sqlx::query_as::<_, JobRow>(&sql)
            .bind(JobId::new().as_uuid())
            .bind(job_type)
            .bind(payload)
            .fetch_one(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("insert", e))?;

        row.try_into()
    }

    #[instrument(skip(self), err)]
    async fn get(&self, id: JobId) -> Result<Option<JobRecord>, JobStoreError> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM background_jobs WHERE id = $1");

        sqlx::query_as::<_, JobRow>(&sql)
            .bind(id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("get", e))?
            .map(JobRecord::try_from)
            .transpose()
    }

    #[instrument(skip(self), err)]
    async fn list_pending(&self, limit: usize) -> Result<Vec<JobRecord>, JobStoreError> {
        let sql = format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM background_jobs
            WHERE status = 'PENDING'
            ORDER BY created_at ASC, id ASC
            LIMIT $1
            "#
        );
        let rows = sqlx::query_as::<_, JobRow>(&sql)
            .bind(limit_param(limit))
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_pending", e))?;

        decode_all(rows)
    }

    #[instrument(skip(self), err)]
    async fn list_failed_eligible_for_retry(
        &self,
        max_retries: u32,
        limit: usize,
    ) -> Result<Vec<JobRecord>, JobStoreError> {
        let max_retries = retry_count_param(max_retries)?;
        let sql = format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM background_jobs
            WHERE status = 'FAILED' AND NOT terminal AND retry_count < $1
            ORDER BY created_at ASC, id ASC
            LIMIT $2
            "#
        );
        let rows = sqlx::query_as::<_, JobRow>(&sql)
            .bind(max_retries)
            .bind(limit_param(limit))
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_failed_eligible_for_retry", e))?;

        decode_all(rows)
    }

    #[instrument(skip(self), err)]
    async fn list_stale_running(
        &self,
        cutoff: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<JobRecord>, JobStoreError> {
        let sql = format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM background_jobs
            WHERE status = 'RUNNING' AND updated_at < $1
            ORDER BY created_at ASC, id ASC
            LIMIT $2
            "#
        );
        let rows = sqlx::query_as::<_, JobRow>(&sql)
            .bind(cutoff)
            .bind(limit_param(limit))
            .fetch_all(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("list_stale_running", e))?;

        decode_all(rows)
    }

    #[instrument(skip(self, job), fields(job_id = %job.id, from = %job.status), err)]
    async fn claim(&self, job: &JobRecord) -> Result<Option<JobRecord>, JobStoreError> {
        let sql = format!(
            r#"
            UPDATE background_jobs
            SET status = 'RUNNING', updated_at = NOW()
            WHERE id = $1 AND status = $2 AND updated_at = $3
            RETURNING {JOB_COLUMNS}
            "#
        );

        sqlx::query_as::<_, JobRow>(&sql)
            .bind(job.id.as_uuid())
            .bind(job.status.as_str())
            .bind(job.updated_at)
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("claim", e))?
            .map(JobRecord::try_from)
            .transpose()
    }

    #[instrument(skip(self), err)]
    async fn update_status(
        &self,
        id: JobId,
        status: JobStatus,
        retry_count: u32,
    ) -> Result<(), JobStoreError> {
        let query = sqlx::query(
            r#"
            UPDATE background_jobs
            SET status = $2,
                retry_count = $3,
                terminal = FALSE,
                last_error = CASE WHEN $2 = 'COMPLETED' THEN NULL ELSE last_error END,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .bind(status.as_str())
        .bind(retry_count_param(retry_count)?);

        self.write("update_status", id, query).await
    }

    #[instrument(skip(self, reason), err)]
    async fn requeue(
        &self,
        id: JobId,
        retry_count: u32,
        reason: &str,
    ) -> Result<(), JobStoreError> {
        let query = sqlx::query(
            r#"
            UPDATE background_jobs
            SET status = 'PENDING',
                retry_count = $2,
                terminal = FALSE,
                last_error = $3,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .bind(retry_count_param(retry_count)?)
        .bind(reason);

        self.write("requeue", id, query).await
    }

    #[instrument(skip(self, reason), err)]
    async fn fail(&self, id: JobId, retry_count: u32, reason: &str) -> Result<(), JobStoreError> {
        let query = sqlx::query(
            r#"
            UPDATE background_jobs
            SET status = 'FAILED',
                retry_count = $2,
                terminal = TRUE,
                last_error = $3,
                updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id.as_uuid())
        .bind(retry_count_param(retry_count)?)
        .bind(reason);

        self.write("fail", id, query).await
    }

    #[instrument(skip(self), err)]
    async fn count_by_status(&self, status: JobStatus) -> Result<u64, JobStoreError> {
        let count: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM background_jobs WHERE status = $1")
                .bind(status.as_str())
                .fetch_one(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("count_by_status", e))?;

        Ok(count.max(0) as u64)
    }

    #[instrument(skip(self), err)]
    async fn count_unfinished_before(&self, cutoff: DateTime<Utc>) -> Result<u64, JobStoreError> {
        let count: i64 = sqlx::query_scalar(
            r#"
            SELECT COUNT(*)
            FROM background_jobs
            WHERE created_at < $1 AND status IN ('PENDING', 'RUNNING')
            "#,
        )
        .bind(cutoff)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("count_unfinished_before", e))?;

        Ok(count.max(0) as u64)
    }

    #[instrument(skip(self), err)]
    async fn delete_older_than(&self, cutoff: DateTime<Utc>) -> Result<u64, JobStoreError> {
        let result = sqlx::query("DELETE FROM background_jobs WHERE created_at < $1")
            .bind(cutoff)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete_older_than", e))?;

        Ok(result.rows_affected())
    }
}

/// Raw `background_jobs` row.
#[derive(Debug)]
struct JobRow {
    id: Uuid,
    job_type: String,
    payload: String,
    status: String,
    retry_count: i32,
    terminal: bool,
    last_error: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl<'r> sqlx::FromRow<'r, PgRow> for JobRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(JobRow {
            id: row.try_get("id")?,
            job_type: row.try_get("job_type")?,
            payload: row.try_get("payload")?,
            status: row.try_get("status")?,
            retry_count: row.try_get("retry_count")?,
            terminal: row.try_get("terminal")?,
            last_error: row.try_get("last_error")?,
            created_at: row.try_get("created_at")?,
            updated_at: row.try_get("updated_at")?,
        })
    }
}

impl TryFrom<JobRow> for JobRecord {
    type Error = JobStoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let status = row
            .status
            .parse::<JobStatus>()
            .map_err(|e| JobStoreError::Corrupt(format!("job {}: {e}", row.id)))?;
        let retry_count = u32::try_from(row.retry_count).map_err(|_| {
            JobStoreError::Corrupt(format!(
                "job {}: negative retry_count {}",
                row.id, row.retry_count
            ))
        })?;

        Ok(JobRecord {
            id: JobId::from_uuid(row.id),
            job_type: row.job_type,
            payload: row.payload,
            status,
            retry_count,
            terminal: row.terminal,
            last_error: row.last_error,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn decode_all(rows: Vec<JobRow>) -> Result<Vec<JobRecord>, JobStoreError> {
    rows.into_iter().map(JobRecord::try_from).collect()
}

fn retry_count_param(value: u32) -> Result<i32, JobStoreError> {
    i32::try_from(value)
        .map_err(|_| JobStoreError::Storage(format!("retry count {value} exceeds INTEGER range")))
}

fn limit_param(limit: usize) -> i64 {
    i64::try_from(limit).unwrap_or(i64::MAX)
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            JobStoreError::Storage(format!("database error in {}: {}", operation, db_err.message()))
        }
        sqlx::Error::PoolClosed => {
            JobStoreError::Storage(format!("connection pool closed in {}", operation))
        }
        sqlx::Error::ColumnDecode { .. } | sqlx::Error::Decode(_) | sqlx::Error::ColumnNotFound(_) => {
            JobStoreError::Corrupt(format!("failed to decode row in {}: {}", operation, err))
        }
        _ => JobStoreError::Storage(format!("sqlx error in {}: {}", operation, err)),
    }
}

/// Check if an error is a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    match err {
        sqlx::Error::Database(db_err) => db_err.code().as_deref() == Some("23505"),
        _ => false,
    }
}
