//! Authorized entry point for periodic tasks, shaped for an HTTP layer.

use std::sync::Arc;

use serde::Serialize;
use serde_json::{Value, json};

use super::auth::{CronAuth, CronCredentials};
use super::guard::{CronGuard, Guarded};
use super::maintenance::Maintenance;
use crate::drafts::StaleDraftRecovery;
use crate::error::StoreError;
use crate::jobs::JobRunner;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CronTask {
    /// Claims are compare-and-swap; no lock needed.
    ProcessJobs,
    StaleDrafts,
    Prune,
}

impl CronTask {
    pub const ALL: [CronTask; 3] = [Self::ProcessJobs, Self::StaleDrafts, Self::Prune];

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == name)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ProcessJobs => "process-jobs",
            Self::StaleDrafts => "stale-drafts",
            Self::Prune => "prune",
        }
    }
}

impl std::fmt::Display for CronTask {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CronResponse {
    pub status: u16,
    pub body: Value,
}

impl CronResponse {
    fn ok(task: CronTask, result: impl Serialize) -> Self {
        Self { status: 200, body: json!({ "task": task.as_str(), "ok": true, "result": result }) }
    }

    fn skipped(task: CronTask) -> Self {
        Self { status: 200, body: json!({ "task": task.as_str(), "ok": true, "skipped": true }) }
    }

    fn error(status: u16, message: impl std::fmt::Display) -> Self {
        Self { status, body: json!({ "ok": false, "error": message.to_string() }) }
    }
}

pub struct CronTrigger {
    auth: CronAuth,
    guard: CronGuard,
    runner: JobRunner,
    recovery: Arc<StaleDraftRecovery>,
    maintenance: Arc<Maintenance>,
    batch_size: usize,
}

impl CronTrigger {
    pub fn new(
        auth: CronAuth,
        guard: CronGuard,
        runner: JobRunner,
        recovery: Arc<StaleDraftRecovery>,
        maintenance: Arc<Maintenance>,
        batch_size: usize,
    ) -> Self {
        Self { auth, guard, runner, recovery, maintenance, batch_size }
    }

    /// Authorize, then run `task`. Credentials are checked before the task
    /// name so an unauthenticated caller learns nothing.
    pub async fn dispatch(&self, task: &str, creds: &CronCredentials) -> CronResponse {
        if let Err(e) = self.auth.authorize(creds) {
            tracing::warn!(task, error = %e, "cron trigger rejected");
            return CronResponse::error(e.status_code(), e);
        }
        match CronTask::from_name(task) {
            Some(task) => self.run_task(task).await,
            None => CronResponse::error(404, format!("unknown task {task}")),
        }
    }

    /// Run an already-authorized task.
    pub async fn run_task(&self, task: CronTask) -> CronResponse {
        let result = match task {
            CronTask::ProcessJobs => {
                self.runner.run_due(self.batch_size).await.map(|stats| CronResponse::ok(task, stats))
            }
            CronTask::StaleDrafts => self.guarded(task, || self.recovery.sweep()).await,
            CronTask::Prune => self.guarded(task, || self.maintenance.prune()).await,
        };
        match result {
            Ok(response) => response,
            Err(e) => {
                tracing::error!(%task, error = %e, "cron task failed");
                CronResponse::error(500, e)
            }
        }
    }

    async fn guarded<F, Fut, T>(&self, task: CronTask, f: F) -> Result<CronResponse, StoreError>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T, StoreError>>,
        T: Serialize,
    {
        match self.guard.run(task.as_str(), f).await? {
            Guarded::Ran(out) => Ok(CronResponse::ok(task, out?)),
            Guarded::Skipped => Ok(CronResponse::skipped(task)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::cron::guard::{AdvisoryLocks, InMemoryLocks, lock_key};
    use crate::drafts::InMemoryDraftStore;
    use crate::jobs::InMemoryJobStore;
    use crate::pipeline::InMemoryPipelineStore;
    use chrono::Duration;

    fn trigger(locks: InMemoryLocks, secret: Option<&str>) -> CronTrigger {
        let clock = Arc::new(ManualClock::default());
        let jobs = Arc::new(InMemoryJobStore::new());
        let recovery = StaleDraftRecovery::new(Arc::new(InMemoryDraftStore::new()), clock.clone(), Duration::minutes(10), 50);
        let maintenance = Maintenance::new(
            jobs.clone(),
            Arc::new(InMemoryPipelineStore::new()),
            clock.clone(),
            Duration::days(30),
            Duration::hours(1),
        );
        CronTrigger::new(
            CronAuth::new(secret.map(str::to_owned)),
            CronGuard::new(Arc::new(locks)),
            JobRunner::new(jobs, clock),
            Arc::new(recovery),
            Arc::new(maintenance),
            10,
        )
    }

    #[tokio::test]
    async fn rejects_before_running_anything() {
        let t = trigger(InMemoryLocks::new(), Some("s3cret"));
        let r = t.dispatch("prune", &CronCredentials::bearer("wrong")).await;
        assert_eq!(r.status, 401);
        let r = t.dispatch("prune", &CronCredentials::default()).await;
        assert_eq!(r.status, 401);

        let disabled = trigger(InMemoryLocks::new(), None);
        assert_eq!(disabled.dispatch("prune", &CronCredentials::bearer("s3cret")).await.status, 503);
    }

    #[tokio::test]
    async fn unknown_task_is_not_found() {
        let t = trigger(InMemoryLocks::new(), Some("s3cret"));
        let r = t.dispatch("reindex", &CronCredentials::header("s3cret")).await;
        assert_eq!(r.status, 404);
    }

    #[tokio::test]
    async fn runs_authorized_tasks() {
        let t = trigger(InMemoryLocks::new(), Some("s3cret"));
        let creds = CronCredentials::bearer("s3cret");

        let r = t.dispatch("process-jobs", &creds).await;
        assert_eq!(r.status, 200);
        assert_eq!(r.body["result"]["claimed"], 0);

        let r = t.dispatch("stale-drafts", &creds).await;
        assert_eq!(r.body["result"]["scanned"], 0);

        let r = t.dispatch("prune", &creds).await;
        assert_eq!(r.body["result"]["skipped"], false);
        let r = t.dispatch("prune", &creds).await;
        assert_eq!(r.body["result"]["skipped"], true);
    }

    #[tokio::test]
    async fn overlapping_invocation_is_a_quiet_no_op() {
        let locks = InMemoryLocks::new();
        let t = trigger(locks.clone(), Some("s3cret"));
        let held = locks.try_acquire(lock_key("stale-drafts")).await.unwrap().unwrap();

        let r = t.dispatch("stale-drafts", &CronCredentials::bearer("s3cret")).await;
        assert_eq!(r.status, 200);
        assert_eq!(r.body["skipped"], true);

        held.release().await.unwrap();
        let r = t.dispatch("stale-drafts", &CronCredentials::bearer("s3cret")).await;
        assert!(r.body.get("skipped").is_none());
    }

    #[test]
    fn task_names_round_trip() {
        for task in CronTask::ALL {
            assert_eq!(CronTask::from_name(task.as_str()), Some(task));
        }
        assert_eq!(CronTask::from_name("PRUNE"), None);
    }
}
