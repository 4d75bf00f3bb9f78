use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::PgPool;
use uuid::Uuid;

use super::store::{JobStore, STALE_EXHAUSTED};
use super::types::{BackgroundJob, EnqueueOutcome, NewJob};
use crate::error::StoreError;
use crate::types::JobStatus;

const JOB_COLUMNS: &str = "id, job_type, workspace_id, lead_id, message_id, dedupe_key, status, \
     attempts, max_attempts, run_at, last_error, locked_at, created_at, updated_at";

/// Row type for sqlx deserialization from the `background_jobs` table.
#[derive(sqlx::FromRow)]
struct JobRow {
    id: Uuid,
    job_type: String,
    workspace_id: String,
    lead_id: String,
    message_id: String,
    dedupe_key: String,
    status: String,
    attempts: i32,
    max_attempts: i32,
    run_at: DateTime<Utc>,
    last_error: Option<String>,
    locked_at: Option<DateTime<Utc>>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<JobRow> for BackgroundJob {
    type Error = StoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let status = JobStatus::from_db(&row.status)
            .ok_or_else(|| StoreError::corrupt(format!("job {} has status {}", row.id, row.status)))?;
        Ok(Self {
            id: row.id,
            job_type: row.job_type,
            workspace_id: row.workspace_id,
            lead_id: row.lead_id,
            message_id: row.message_id,
            dedupe_key: row.dedupe_key,
            status,
            attempts: row.attempts,
            max_attempts: row.max_attempts,
            run_at: row.run_at,
            last_error: row.last_error,
            locked_at: row.locked_at,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn into_jobs(rows: Vec<JobRow>) -> Result<Vec<BackgroundJob>, StoreError> {
    rows.into_iter().map(BackgroundJob::try_from).collect()
}

/// Insert a PENDING job. Returns false when the dedupe key already exists.
pub async fn insert(pool: &PgPool, job: &NewJob, now: DateTime<Utc>) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        "INSERT INTO background_jobs (id, job_type, workspace_id, lead_id, message_id, dedupe_key, status, attempts, max_attempts, run_at, created_at, updated_at)
         VALUES ($1, $2, $3, $4, $5, $6, 'PENDING', 0, $7, $8, $9, $9)
         ON CONFLICT (dedupe_key) DO NOTHING"
    )
    .bind(Uuid::new_v4())
    .bind(&job.job_type)
    .bind(&job.workspace_id)
    .bind(&job.lead_id)
    .bind(&job.message_id)
    .bind(&job.dedupe_key)
    .bind(job.max_attempts)
    .bind(job.run_at)
    .bind(now)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Claim due jobs. `SKIP LOCKED` lets racing runners partition the batch; the
/// outer status check keeps the transition a compare-and-swap.
async fn claim_due(pool: &PgPool, now: DateTime<Utc>, limit: i64) -> Result<Vec<JobRow>, sqlx::Error> {
    sqlx::query_as(&format!(
        "UPDATE background_jobs
         SET status = 'RUNNING', attempts = attempts + 1, locked_at = $1, updated_at = $1
         WHERE status = 'PENDING' AND id IN (
             SELECT id FROM background_jobs
             WHERE status = 'PENDING' AND run_at <= $1 AND attempts < max_attempts
             ORDER BY run_at, created_at
             LIMIT $2
             FOR UPDATE SKIP LOCKED
         )
         RETURNING {JOB_COLUMNS}"
    ))
    .bind(now)
    .bind(limit)
    .fetch_all(pool)
    .await
}

/// Move a RUNNING job to `status`. Returns false if the job was not RUNNING.
pub async fn finish(
    pool: &PgPool,
    id: Uuid,
    status: JobStatus,
    run_at: Option<DateTime<Utc>>,
    error: Option<&str>,
    now: DateTime<Utc>,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE background_jobs
         SET status = $2, run_at = COALESCE($3, run_at), last_error = $4, locked_at = NULL, updated_at = $5
         WHERE id = $1 AND status = 'RUNNING'"
    )
    .bind(id)
    .bind(status.as_db_str())
    .bind(run_at)
    .bind(error)
    .bind(now)
    .execute(pool)
    .await?;
    Ok(result.rows_affected() > 0)
}

/// Stale RUNNING rows go back to PENDING, or to FAILED when the stale claim
/// was their last attempt.
pub async fn requeue_stale(pool: &PgPool, locked_before: DateTime<Utc>, now: DateTime<Utc>) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        "UPDATE background_jobs
         SET status = CASE WHEN attempts >= max_attempts THEN 'FAILED' ELSE 'PENDING' END,
             last_error = CASE WHEN attempts >= max_attempts THEN $3 ELSE last_error END,
             run_at = CASE WHEN attempts >= max_attempts THEN run_at ELSE $2 END,
             locked_at = NULL,
             updated_at = $2
         WHERE status = 'RUNNING' AND locked_at < $1"
    )
    .bind(locked_before)
    .bind(now)
    .bind(STALE_EXHAUSTED)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

async fn fetch_by_id(pool: &PgPool, id: Uuid) -> Result<Option<JobRow>, sqlx::Error> {
    sqlx::query_as(&format!("SELECT {JOB_COLUMNS} FROM background_jobs WHERE id = $1"))
        .bind(id)
        .fetch_optional(pool)
        .await
}

async fn fetch_by_dedupe_key(pool: &PgPool, key: &str) -> Result<Option<JobRow>, sqlx::Error> {
    sqlx::query_as(&format!("SELECT {JOB_COLUMNS} FROM background_jobs WHERE dedupe_key = $1"))
        .bind(key)
        .fetch_optional(pool)
        .await
}

pub async fn delete_finished(pool: &PgPool, before: DateTime<Utc>) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        "DELETE FROM background_jobs WHERE status IN ('SUCCEEDED', 'FAILED') AND updated_at < $1"
    )
    .bind(before)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

/// [`JobStore`] over the `background_jobs` table.
#[derive(Debug, Clone)]
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn enqueue(&self, job: &NewJob, now: DateTime<Utc>) -> Result<EnqueueOutcome, StoreError> {
        let enqueued = insert(&self.pool, job, now).await?;
        Ok(EnqueueOutcome { enqueued, dedupe_key: job.dedupe_key.clone() })
    }

    async fn claim_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<BackgroundJob>, StoreError> {
        into_jobs(claim_due(&self.pool, now, limit as i64).await?)
    }

    async fn mark_succeeded(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool, StoreError> {
        Ok(finish(&self.pool, id, JobStatus::Succeeded, None, None, now).await?)
    }

    async fn reschedule(
        &self,
        id: Uuid,
        run_at: DateTime<Utc>,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        Ok(finish(&self.pool, id, JobStatus::Pending, Some(run_at), Some(error), now).await?)
    }

    async fn mark_failed(&self, id: Uuid, error: &str, now: DateTime<Utc>) -> Result<bool, StoreError> {
        Ok(finish(&self.pool, id, JobStatus::Failed, None, Some(error), now).await?)
    }

    async fn requeue_stale(&self, locked_before: DateTime<Utc>, now: DateTime<Utc>) -> Result<u64, StoreError> {
        Ok(requeue_stale(&self.pool, locked_before, now).await?)
    }

    async fn get(&self, id: Uuid) -> Result<Option<BackgroundJob>, StoreError> {
        fetch_by_id(&self.pool, id).await?.map(BackgroundJob::try_from).transpose()
    }

    async fn get_by_dedupe_key(&self, key: &str) -> Result<Option<BackgroundJob>, StoreError> {
        fetch_by_dedupe_key(&self.pool, key).await?.map(BackgroundJob::try_from).transpose()
    }

    async fn prune_finished(&self, before: DateTime<Utc>) -> Result<u64, StoreError> {
        Ok(delete_finished(&self.pool, before).await?)
    }
}
