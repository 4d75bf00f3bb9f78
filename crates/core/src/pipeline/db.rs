use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::PgPool;
use uuid::Uuid;

use super::store::PipelineStore;
use crate::error::StoreError;
use crate::types::{Channel, LoopStopReason, PipelineArtifact, PipelineRun, RevisionLoopSummary, RunStatus};

/// Row type for sqlx deserialization from the `pipeline_runs` table.
#[derive(sqlx::FromRow)]
struct RunRow {
    id: Uuid,
    trigger_message_id: String,
    channel: String,
    draft_id: Option<Uuid>,
    status: String,
    created_at: DateTime<Utc>,
}

impl TryFrom<RunRow> for PipelineRun {
    type Error = StoreError;

    fn try_from(row: RunRow) -> Result<Self, Self::Error> {
        Ok(Self {
            channel: Channel::from_db(&row.channel)
                .ok_or_else(|| StoreError::corrupt(format!("run {} has channel {}", row.id, row.channel)))?,
            status: RunStatus::from_db(&row.status)
                .ok_or_else(|| StoreError::corrupt(format!("run {} has status {}", row.id, row.status)))?,
            id: row.id,
            trigger_message_id: row.trigger_message_id,
            draft_id: row.draft_id,
            created_at: row.created_at,
        })
    }
}

#[derive(sqlx::FromRow)]
struct ArtifactRow {
    run_id: Uuid,
    stage: String,
    iteration: i32,
    payload: Value,
    created_at: DateTime<Utc>,
}

impl From<ArtifactRow> for PipelineArtifact {
    fn from(row: ArtifactRow) -> Self {
        Self {
            run_id: row.run_id,
            stage: row.stage,
            iteration: row.iteration,
            payload: row.payload,
            created_at: row.created_at,
        }
    }
}

#[derive(sqlx::FromRow)]
struct SummaryRow {
    stop_reason: String,
    iterations_used: i32,
    threshold: f64,
    start_confidence: f64,
    end_confidence: f64,
    delta_confidence: f64,
    cache_hits: i32,
    elapsed_ms: i64,
    channel: String,
    error: Option<String>,
}

impl TryFrom<SummaryRow> for RevisionLoopSummary {
    type Error = StoreError;

    fn try_from(row: SummaryRow) -> Result<Self, Self::Error> {
        let stop_reason: LoopStopReason = serde_json::from_value(Value::String(row.stop_reason.clone()))
            .map_err(|_| StoreError::corrupt(format!("stop reason {}", row.stop_reason)))?;
        Ok(Self {
            stop_reason,
            iterations_used: row.iterations_used.max(0) as u32,
            threshold: row.threshold,
            start_confidence: row.start_confidence,
            end_confidence: row.end_confidence,
            delta_confidence: row.delta_confidence,
            cache_hits: row.cache_hits.max(0) as u32,
            elapsed_ms: row.elapsed_ms.max(0) as u64,
            channel: Channel::from_db(&row.channel)
                .ok_or_else(|| StoreError::corrupt(format!("summary channel {}", row.channel)))?,
            error: row.error,
        })
    }
}

const RUN_COLUMNS: &str = "id, trigger_message_id, channel, draft_id, status, created_at";

/// Insert a run, or fetch the existing one on (trigger_message_id, channel) conflict.
pub async fn get_or_create_run(
    pool: &PgPool,
    trigger_message_id: &str,
    channel: Channel,
    now: DateTime<Utc>,
) -> Result<(PipelineRun, bool), StoreError> {
    let inserted: Option<RunRow> = sqlx::query_as(&format!(
        "INSERT INTO pipeline_runs (id, trigger_message_id, channel, status, created_at, updated_at)
         VALUES ($1, $2, $3, 'RUNNING', $4, $4)
         ON CONFLICT (trigger_message_id, channel) DO NOTHING
         RETURNING {RUN_COLUMNS}"
    ))
    .bind(Uuid::new_v4())
    .bind(trigger_message_id)
    .bind(channel.as_db_str())
    .bind(now)
    .fetch_optional(pool)
    .await?;
    if let Some(row) = inserted {
        return Ok((row.try_into()?, true));
    }

    let existing: RunRow = sqlx::query_as(&format!(
        "SELECT {RUN_COLUMNS} FROM pipeline_runs WHERE trigger_message_id = $1 AND channel = $2"
    ))
    .bind(trigger_message_id)
    .bind(channel.as_db_str())
    .fetch_one(pool)
    .await?;
    Ok((existing.try_into()?, false))
}

pub async fn fetch_run(pool: &PgPool, run_id: Uuid) -> Result<Option<PipelineRun>, StoreError> {
    let row: Option<RunRow> = sqlx::query_as(&format!("SELECT {RUN_COLUMNS} FROM pipeline_runs WHERE id = $1"))
        .bind(run_id)
        .fetch_optional(pool)
        .await?;
    row.map(PipelineRun::try_from).transpose()
}

pub async fn update_run(
    pool: &PgPool,
    run_id: Uuid,
    draft_id: Option<Uuid>,
    status: Option<RunStatus>,
    now: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "UPDATE pipeline_runs
         SET draft_id = COALESCE($2, draft_id), status = COALESCE($3, status), updated_at = $4
         WHERE id = $1"
    )
    .bind(run_id)
    .bind(draft_id)
    .bind(status.map(|s| s.as_db_str()))
    .bind(now)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn upsert_artifact(
    pool: &PgPool,
    run_id: Uuid,
    stage: &str,
    iteration: i32,
    payload: &Value,
    now: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO pipeline_artifacts (run_id, stage, iteration, payload, created_at, updated_at)
         VALUES ($1, $2, $3, $4, $5, $5)
         ON CONFLICT (run_id, stage, iteration)
         DO UPDATE SET payload = EXCLUDED.payload, updated_at = EXCLUDED.updated_at"
    )
    .bind(run_id)
    .bind(stage)
    .bind(iteration)
    .bind(payload)
    .bind(now)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn fetch_artifact(
    pool: &PgPool,
    run_id: Uuid,
    stage: &str,
    iteration: i32,
) -> Result<Option<PipelineArtifact>, sqlx::Error> {
    let row: Option<ArtifactRow> = sqlx::query_as(
        "SELECT run_id, stage, iteration, payload, created_at FROM pipeline_artifacts
         WHERE run_id = $1 AND stage = $2 AND iteration = $3"
    )
    .bind(run_id)
    .bind(stage)
    .bind(iteration)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(Into::into))
}

pub async fn fetch_artifacts(pool: &PgPool, run_id: Uuid) -> Result<Vec<PipelineArtifact>, sqlx::Error> {
    let rows: Vec<ArtifactRow> = sqlx::query_as(
        "SELECT run_id, stage, iteration, payload, created_at FROM pipeline_artifacts
         WHERE run_id = $1 ORDER BY created_at, iteration"
    )
    .bind(run_id)
    .fetch_all(pool)
    .await?;
    Ok(rows.into_iter().map(Into::into).collect())
}

pub async fn upsert_loop_summary(
    pool: &PgPool,
    run_id: Uuid,
    s: &RevisionLoopSummary,
    now: DateTime<Utc>,
) -> Result<(), sqlx::Error> {
    sqlx::query(
        "INSERT INTO pipeline_loop_summaries
             (run_id, stop_reason, iterations_used, threshold, start_confidence, end_confidence,
              delta_confidence, cache_hits, elapsed_ms, channel, error, created_at)
         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
         ON CONFLICT (run_id) DO UPDATE SET
             stop_reason = EXCLUDED.stop_reason,
             iterations_used = EXCLUDED.iterations_used,
             threshold = EXCLUDED.threshold,
             start_confidence = EXCLUDED.start_confidence,
             end_confidence = EXCLUDED.end_confidence,
             delta_confidence = EXCLUDED.delta_confidence,
             cache_hits = EXCLUDED.cache_hits,
             elapsed_ms = EXCLUDED.elapsed_ms,
             error = EXCLUDED.error"
    )
    .bind(run_id)
    .bind(s.stop_reason.as_str())
    .bind(s.iterations_used as i32)
    .bind(s.threshold)
    .bind(s.start_confidence)
    .bind(s.end_confidence)
    .bind(s.delta_confidence)
    .bind(s.cache_hits as i32)
    .bind(s.elapsed_ms as i64)
    .bind(s.channel.as_db_str())
    .bind(&s.error)
    .bind(now)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn fetch_loop_summary(pool: &PgPool, run_id: Uuid) -> Result<Option<RevisionLoopSummary>, StoreError> {
    let row: Option<SummaryRow> = sqlx::query_as(
        "SELECT stop_reason, iterations_used, threshold, start_confidence, end_confidence,
                delta_confidence, cache_hits, elapsed_ms, channel, error
         FROM pipeline_loop_summaries WHERE run_id = $1"
    )
    .bind(run_id)
    .fetch_optional(pool)
    .await?;
    row.map(RevisionLoopSummary::try_from).transpose()
}

pub async fn delete_finished_artifacts(pool: &PgPool, before: DateTime<Utc>) -> Result<u64, sqlx::Error> {
    let result = sqlx::query(
        "DELETE FROM pipeline_artifacts a
         USING pipeline_runs r
         WHERE a.run_id = r.id AND r.status <> 'RUNNING' AND r.updated_at < $1"
    )
    .bind(before)
    .execute(pool)
    .await?;
    Ok(result.rows_affected())
}

/// [`PipelineStore`] over `pipeline_runs`, `pipeline_artifacts` and
/// `pipeline_loop_summaries`.
#[derive(Debug, Clone)]
pub struct PgPipelineStore {
    pool: PgPool,
}

impl PgPipelineStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PipelineStore for PgPipelineStore {
    async fn get_or_create_run(
        &self,
        trigger_message_id: &str,
        channel: Channel,
        now: DateTime<Utc>,
    ) -> Result<(PipelineRun, bool), StoreError> {
        get_or_create_run(&self.pool, trigger_message_id, channel, now).await
    }

    async fn get_run(&self, run_id: Uuid) -> Result<Option<PipelineRun>, StoreError> {
        fetch_run(&self.pool, run_id).await
    }

    async fn attach_draft(&self, run_id: Uuid, draft_id: Uuid, now: DateTime<Utc>) -> Result<(), StoreError> {
        Ok(update_run(&self.pool, run_id, Some(draft_id), None, now).await?)
    }

    async fn set_run_status(&self, run_id: Uuid, status: RunStatus, now: DateTime<Utc>) -> Result<(), StoreError> {
        Ok(update_run(&self.pool, run_id, None, Some(status), now).await?)
    }

    async fn upsert_artifact(
        &self,
        run_id: Uuid,
        stage: &str,
        iteration: i32,
        payload: Value,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        Ok(upsert_artifact(&self.pool, run_id, stage, iteration, &payload, now).await?)
    }

    async fn load_artifact(
        &self,
        run_id: Uuid,
        stage: &str,
        iteration: i32,
    ) -> Result<Option<PipelineArtifact>, StoreError> {
        Ok(fetch_artifact(&self.pool, run_id, stage, iteration).await?)
    }

    async fn list_artifacts(&self, run_id: Uuid) -> Result<Vec<PipelineArtifact>, StoreError> {
        Ok(fetch_artifacts(&self.pool, run_id).await?)
    }

    async fn record_loop_summary(
        &self,
        run_id: Uuid,
        summary: &RevisionLoopSummary,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        Ok(upsert_loop_summary(&self.pool, run_id, summary, now).await?)
    }

    async fn loop_summary(&self, run_id: Uuid) -> Result<Option<RevisionLoopSummary>, StoreError> {
        fetch_loop_summary(&self.pool, run_id).await
    }

    async fn prune_artifacts(&self, before: DateTime<Utc>) -> Result<u64, StoreError> {
        Ok(delete_finished_artifacts(&self.pool, before).await?)
    }
}
