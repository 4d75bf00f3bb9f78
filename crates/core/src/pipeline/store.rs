use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use uuid::Uuid;

use crate::error::{StoreError, poisoned};
use crate::types::{Channel, PipelineArtifact, PipelineRun, RevisionLoopSummary, RunStatus};

/// Run and artifact persistence.
#[async_trait]
pub trait PipelineStore: Send + Sync {
    /// Insert a RUNNING run for (trigger message, channel), or return the
    /// existing one. The flag is true only for the caller that created it.
    async fn get_or_create_run(
        &self,
        trigger_message_id: &str,
        channel: Channel,
        now: DateTime<Utc>,
    ) -> Result<(PipelineRun, bool), StoreError>;

    async fn get_run(&self, run_id: Uuid) -> Result<Option<PipelineRun>, StoreError>;

    async fn attach_draft(&self, run_id: Uuid, draft_id: Uuid, now: DateTime<Utc>) -> Result<(), StoreError>;

    async fn set_run_status(&self, run_id: Uuid, status: RunStatus, now: DateTime<Utc>) -> Result<(), StoreError>;

    /// Idempotent upsert on (run, stage, iteration). Callers cap the payload.
    async fn upsert_artifact(
        &self,
        run_id: Uuid,
        stage: &str,
        iteration: i32,
        payload: Value,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn load_artifact(
        &self,
        run_id: Uuid,
        stage: &str,
        iteration: i32,
    ) -> Result<Option<PipelineArtifact>, StoreError>;

    /// All artifacts of a run ordered by stage write order then iteration.
    async fn list_artifacts(&self, run_id: Uuid) -> Result<Vec<PipelineArtifact>, StoreError>;

    /// Queryable copy of the loop summary, one per run.
    async fn record_loop_summary(
        &self,
        run_id: Uuid,
        summary: &RevisionLoopSummary,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError>;

    async fn loop_summary(&self, run_id: Uuid) -> Result<Option<RevisionLoopSummary>, StoreError>;

    /// Delete artifacts of runs that finished before `before`. Run rows stay:
    /// they are the idempotency boundary for redelivered triggers.
    async fn prune_artifacts(&self, before: DateTime<Utc>) -> Result<u64, StoreError>;
}

#[derive(Debug, Default)]
struct Tables {
    runs: HashMap<Uuid, PipelineRun>,
    run_updated: HashMap<Uuid, DateTime<Utc>>,
    artifacts: Vec<PipelineArtifact>,
    summaries: HashMap<Uuid, RevisionLoopSummary>,
}

/// In-memory run/artifact store for tests and ephemeral mode.
#[derive(Debug, Default)]
pub struct InMemoryPipelineStore {
    tables: Mutex<Tables>,
}

impl InMemoryPipelineStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn run_count(&self) -> usize {
        self.tables.lock().map(|t| t.runs.len()).unwrap_or(0)
    }
}

#[async_trait]
impl PipelineStore for InMemoryPipelineStore {
    async fn get_or_create_run(
        &self,
        trigger_message_id: &str,
        channel: Channel,
        now: DateTime<Utc>,
    ) -> Result<(PipelineRun, bool), StoreError> {
        let mut t = self.tables.lock().map_err(poisoned)?;
        if let Some(run) = t
            .runs
            .values()
            .find(|r| r.trigger_message_id == trigger_message_id && r.channel == channel)
        {
            return Ok((run.clone(), false));
        }
        let run = PipelineRun {
            id: Uuid::new_v4(),
            trigger_message_id: trigger_message_id.to_owned(),
            channel,
            draft_id: None,
            status: RunStatus::Running,
            created_at: now,
        };
        t.runs.insert(run.id, run.clone());
        t.run_updated.insert(run.id, now);
        Ok((run, true))
    }

    async fn get_run(&self, run_id: Uuid) -> Result<Option<PipelineRun>, StoreError> {
        Ok(self.tables.lock().map_err(poisoned)?.runs.get(&run_id).cloned())
    }

    async fn attach_draft(&self, run_id: Uuid, draft_id: Uuid, now: DateTime<Utc>) -> Result<(), StoreError> {
        let mut t = self.tables.lock().map_err(poisoned)?;
        let run = t.runs.get_mut(&run_id).ok_or_else(|| StoreError::not_found(format!("run {run_id}")))?;
        run.draft_id = Some(draft_id);
        t.run_updated.insert(run_id, now);
        Ok(())
    }

    async fn set_run_status(&self, run_id: Uuid, status: RunStatus, now: DateTime<Utc>) -> Result<(), StoreError> {
        let mut t = self.tables.lock().map_err(poisoned)?;
        let run = t.runs.get_mut(&run_id).ok_or_else(|| StoreError::not_found(format!("run {run_id}")))?;
        run.status = status;
        t.run_updated.insert(run_id, now);
        Ok(())
    }

    async fn upsert_artifact(
        &self,
        run_id: Uuid,
        stage: &str,
        iteration: i32,
        payload: Value,
        now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        let mut t = self.tables.lock().map_err(poisoned)?;
        let existing = t
            .artifacts
            .iter()
            .position(|a| a.run_id == run_id && a.stage == stage && a.iteration == iteration);
        match existing {
            Some(i) => t.artifacts[i].payload = payload,
            None => t.artifacts.push(PipelineArtifact {
                run_id,
                stage: stage.to_owned(),
                iteration,
                payload,
                created_at: now,
            }),
        }
        Ok(())
    }

    async fn load_artifact(
        &self,
        run_id: Uuid,
        stage: &str,
        iteration: i32,
    ) -> Result<Option<PipelineArtifact>, StoreError> {
        let t = self.tables.lock().map_err(poisoned)?;
        Ok(t.artifacts
            .iter()
            .find(|a| a.run_id == run_id && a.stage == stage && a.iteration == iteration)
            .cloned())
    }

    async fn list_artifacts(&self, run_id: Uuid) -> Result<Vec<PipelineArtifact>, StoreError> {
        let t = self.tables.lock().map_err(poisoned)?;
        Ok(t.artifacts.iter().filter(|a| a.run_id == run_id).cloned().collect())
    }

    async fn record_loop_summary(
        &self,
        run_id: Uuid,
        summary: &RevisionLoopSummary,
        _now: DateTime<Utc>,
    ) -> Result<(), StoreError> {
        self.tables.lock().map_err(poisoned)?.summaries.insert(run_id, summary.clone());
        Ok(())
    }

    async fn loop_summary(&self, run_id: Uuid) -> Result<Option<RevisionLoopSummary>, StoreError> {
        Ok(self.tables.lock().map_err(poisoned)?.summaries.get(&run_id).cloned())
    }

    async fn prune_artifacts(&self, before: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut t = self.tables.lock().map_err(poisoned)?;
        let finished: Vec<Uuid> = t
            .runs
            .values()
            .filter(|r| r.status != RunStatus::Running)
            .filter(|r| t.run_updated.get(&r.id).is_some_and(|u| *u < before))
            .map(|r| r.id)
            .collect();
        let start = t.artifacts.len();
        t.artifacts.retain(|a| !finished.contains(&a.run_id));
        Ok((start - t.artifacts.len()) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use serde_json::json;

    #[tokio::test]
    async fn duplicate_trigger_joins_existing_run() {
        let store = InMemoryPipelineStore::new();
        let now = Utc::now();
        let (a, created_a) = store.get_or_create_run("m1", Channel::Email, now).await.unwrap();
        let (b, created_b) = store.get_or_create_run("m1", Channel::Email, now).await.unwrap();
        let (c, created_c) = store.get_or_create_run("m1", Channel::Sms, now).await.unwrap();
        assert!(created_a && !created_b && created_c);
        assert_eq!(a.id, b.id);
        assert_ne!(a.id, c.id);
        assert_eq!(a.status, RunStatus::Running);
        assert_eq!(store.run_count(), 2);
    }

    #[tokio::test]
    async fn artifact_upsert_overwrites_same_key() {
        let store = InMemoryPipelineStore::new();
        let now = Utc::now();
        let (run, _) = store.get_or_create_run("m1", Channel::Email, now).await.unwrap();
        store.upsert_artifact(run.id, "strategy", 0, json!({"v": 1}), now).await.unwrap();
        store.upsert_artifact(run.id, "strategy", 0, json!({"v": 2}), now).await.unwrap();
        store.upsert_artifact(run.id, "auto_send_revision", 1, json!({}), now).await.unwrap();

        let all = store.list_artifacts(run.id).await.unwrap();
        assert_eq!(all.len(), 2);
        let s = store.load_artifact(run.id, "strategy", 0).await.unwrap().unwrap();
        assert_eq!(s.payload["v"], 2);
    }

    #[tokio::test]
    async fn prune_skips_running_and_recent_runs() {
        let store = InMemoryPipelineStore::new();
        let t0 = Utc::now();
        let (done, _) = store.get_or_create_run("m1", Channel::Email, t0).await.unwrap();
        let (live, _) = store.get_or_create_run("m2", Channel::Email, t0).await.unwrap();
        store.upsert_artifact(done.id, "strategy", 0, json!({}), t0).await.unwrap();
        store.upsert_artifact(live.id, "strategy", 0, json!({}), t0).await.unwrap();
        store.set_run_status(done.id, RunStatus::Completed, t0).await.unwrap();

        assert_eq!(store.prune_artifacts(t0).await.unwrap(), 0);
        assert_eq!(store.prune_artifacts(t0 + Duration::days(31)).await.unwrap(), 1);
        assert_eq!(store.list_artifacts(live.id).await.unwrap().len(), 1);
        assert!(store.get_run(done.id).await.unwrap().is_some());
    }
}
