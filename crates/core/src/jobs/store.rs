use std::collections::HashMap;
use std::sync::Mutex;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::types::{BackgroundJob, EnqueueOutcome, NewJob};
use crate::error::{StoreError, poisoned};
use crate::types::JobStatus;

/// `last_error` for a job whose lock went stale on its final attempt.
pub const STALE_EXHAUSTED: &str = "stale lock, attempts exhausted";

/// Persistence contract for background jobs.
///
/// Every status transition is conditional on the current status so racing
/// runners can never both own a job.
#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert a PENDING job. A dedupe-key collision is a no-op, not an error.
    async fn enqueue(&self, job: &NewJob, now: DateTime<Utc>) -> Result<EnqueueOutcome, StoreError>;

    /// Atomically move up to `limit` due PENDING jobs with attempts left to
    /// RUNNING, incrementing their attempts. Returns only the jobs this caller
    /// won.
    async fn claim_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<BackgroundJob>, StoreError>;

    async fn mark_succeeded(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool, StoreError>;

    async fn reschedule(
        &self,
        id: Uuid,
        run_at: DateTime<Utc>,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError>;

    async fn mark_failed(&self, id: Uuid, error: &str, now: DateTime<Utc>) -> Result<bool, StoreError>;

    /// Reclaim RUNNING jobs locked before `locked_before`: back to PENDING
    /// while attempts remain, FAILED once they are exhausted. Returns the
    /// number of jobs reclaimed.
    async fn requeue_stale(&self, locked_before: DateTime<Utc>, now: DateTime<Utc>) -> Result<u64, StoreError>;

    async fn get(&self, id: Uuid) -> Result<Option<BackgroundJob>, StoreError>;

    async fn get_by_dedupe_key(&self, key: &str) -> Result<Option<BackgroundJob>, StoreError>;

    /// Delete SUCCEEDED/FAILED jobs last touched before `before`.
    async fn prune_finished(&self, before: DateTime<Utc>) -> Result<u64, StoreError>;
}

/// In-memory job store for tests and ephemeral mode.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    jobs: Mutex<HashMap<Uuid, BackgroundJob>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.jobs.lock().map(|j| j.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn transition(
        &self,
        id: Uuid,
        apply: impl FnOnce(&mut BackgroundJob),
    ) -> Result<bool, StoreError> {
        let mut jobs = self.jobs.lock().map_err(poisoned)?;
        match jobs.get_mut(&id) {
            Some(job) if job.status == JobStatus::Running => {
                apply(job);
                Ok(true)
            }
            _ => Ok(false),
        }
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn enqueue(&self, job: &NewJob, now: DateTime<Utc>) -> Result<EnqueueOutcome, StoreError> {
        let mut jobs = self.jobs.lock().map_err(poisoned)?;
        if jobs.values().any(|j| j.dedupe_key == job.dedupe_key) {
            return Ok(EnqueueOutcome { enqueued: false, dedupe_key: job.dedupe_key.clone() });
        }
        let id = Uuid::new_v4();
        jobs.insert(
            id,
            BackgroundJob {
                id,
                job_type: job.job_type.clone(),
                workspace_id: job.workspace_id.clone(),
                lead_id: job.lead_id.clone(),
                message_id: job.message_id.clone(),
                dedupe_key: job.dedupe_key.clone(),
                status: JobStatus::Pending,
                attempts: 0,
                max_attempts: job.max_attempts,
                run_at: job.run_at,
                last_error: None,
                locked_at: None,
                created_at: now,
                updated_at: now,
            },
        );
        Ok(EnqueueOutcome { enqueued: true, dedupe_key: job.dedupe_key.clone() })
    }

    async fn claim_due(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<BackgroundJob>, StoreError> {
        let mut jobs = self.jobs.lock().map_err(poisoned)?;
        let mut due: Vec<&mut BackgroundJob> = jobs
            .values_mut()
            .filter(|j| j.status == JobStatus::Pending && j.run_at <= now && !j.attempts_exhausted())
            .collect();
        due.sort_by_key(|j| (j.run_at, j.created_at));
        Ok(due
            .into_iter()
            .take(limit)
            .map(|job| {
                job.status = JobStatus::Running;
                job.attempts += 1;
                job.locked_at = Some(now);
                job.updated_at = now;
                job.clone()
            })
            .collect())
    }

    async fn mark_succeeded(&self, id: Uuid, now: DateTime<Utc>) -> Result<bool, StoreError> {
        self.transition(id, |job| {
            job.status = JobStatus::Succeeded;
            job.locked_at = None;
            job.last_error = None;
            job.updated_at = now;
        })
    }

    async fn reschedule(
        &self,
        id: Uuid,
        run_at: DateTime<Utc>,
        error: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, StoreError> {
        self.transition(id, |job| {
            job.status = JobStatus::Pending;
            job.run_at = run_at;
            job.locked_at = None;
            job.last_error = Some(error.to_owned());
            job.updated_at = now;
        })
    }

    async fn mark_failed(&self, id: Uuid, error: &str, now: DateTime<Utc>) -> Result<bool, StoreError> {
        self.transition(id, |job| {
            job.status = JobStatus::Failed;
            job.locked_at = None;
            job.last_error = Some(error.to_owned());
            job.updated_at = now;
        })
    }

    async fn requeue_stale(&self, locked_before: DateTime<Utc>, now: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut jobs = self.jobs.lock().map_err(poisoned)?;
        let mut n = 0;
        for job in jobs.values_mut() {
            if job.status == JobStatus::Running && job.locked_at.is_some_and(|t| t < locked_before) {
                if job.attempts_exhausted() {
                    job.status = JobStatus::Failed;
                    job.last_error = Some(STALE_EXHAUSTED.to_owned());
                } else {
                    job.status = JobStatus::Pending;
                    job.run_at = now;
                }
                job.locked_at = None;
                job.updated_at = now;
                n += 1;
            }
        }
        Ok(n)
    }

    async fn get(&self, id: Uuid) -> Result<Option<BackgroundJob>, StoreError> {
        Ok(self.jobs.lock().map_err(poisoned)?.get(&id).cloned())
    }

    async fn get_by_dedupe_key(&self, key: &str) -> Result<Option<BackgroundJob>, StoreError> {
        let jobs = self.jobs.lock().map_err(poisoned)?;
        Ok(jobs.values().find(|j| j.dedupe_key == key).cloned())
    }

    async fn prune_finished(&self, before: DateTime<Utc>) -> Result<u64, StoreError> {
        let mut jobs = self.jobs.lock().map_err(poisoned)?;
        let start = jobs.len();
        jobs.retain(|_, j| !(j.status.is_terminal() && j.updated_at < before));
        Ok((start - jobs.len()) as u64)
    }
}
