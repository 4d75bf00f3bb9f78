use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Duration as ChronoDuration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;

use super::store::JobStore;
use super::types::{BackgroundJob, JobError, RetryPolicy, RunStats};
use crate::clock::Clock;
use crate::error::StoreError;

/// Executes one job type.
#[async_trait]
pub trait JobHandler: Send + Sync {
    fn job_type(&self) -> &'static str;

    async fn handle(&self, job: &BackgroundJob) -> Result<(), JobError>;
}

enum Outcome {
    Succeeded,
    Retried,
    Failed,
    /// Lost the row to another writer (stale requeue or a racing runner).
    Lost,
}

/// Claims due jobs and dispatches them to registered handlers.
///
/// Mutual exclusion between runner instances comes from the store's
/// compare-and-swap claim, never from a lock.
#[derive(Clone)]
pub struct JobRunner {
    store: Arc<dyn JobStore>,
    clock: Arc<dyn Clock>,
    handlers: HashMap<&'static str, Arc<dyn JobHandler>>,
    retry: RetryPolicy,
    stale_after: ChronoDuration,
}

impl JobRunner {
    pub fn new(store: Arc<dyn JobStore>, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            handlers: HashMap::new(),
            retry: RetryPolicy::default(),
            stale_after: ChronoDuration::seconds(900),
        }
    }

    pub fn with_retry_policy(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_stale_after(mut self, stale_after: ChronoDuration) -> Self {
        self.stale_after = stale_after;
        self
    }

    pub fn register(&mut self, handler: Arc<dyn JobHandler>) {
        self.handlers.insert(handler.job_type(), handler);
    }

    /// One pass: requeue stale RUNNING jobs, claim up to `limit` due jobs and
    /// run them concurrently.
    pub async fn run_due(&self, limit: usize) -> Result<RunStats, StoreError> {
        let now = self.clock.now();
        let mut stats = RunStats {
            requeued: self.store.requeue_stale(now - self.stale_after, now).await?,
            ..RunStats::default()
        };
        if stats.requeued > 0 {
            tracing::warn!(count = stats.requeued, "reclaimed stale running jobs");
        }

        let claimed = self.store.claim_due(now, limit).await?;
        stats.claimed = claimed.len();

        let mut tasks = JoinSet::new();
        let mut in_flight = HashMap::new();
        for job in claimed {
            let runner = self.clone();
            let owned = job.clone();
            let handle = tasks.spawn(async move { runner.execute(owned).await });
            in_flight.insert(handle.id(), job);
        }
        while let Some(joined) = tasks.join_next().await {
            let outcome = match joined {
                Ok(outcome) => outcome,
                Err(e) => {
                    // The row is still RUNNING; settle it like any other failed attempt.
                    let Some(job) = in_flight.remove(&e.id()) else {
                        tracing::error!(error = %e, "job task ended without a tracked job");
                        continue;
                    };
                    tracing::error!(job_id = %job.id, error = %e, "job task panicked");
                    self.settle(&job, Err(JobError::Failed(format!("handler panicked: {e}")))).await
                }
            };
            match outcome {
                Ok(Outcome::Succeeded) => stats.succeeded += 1,
                Ok(Outcome::Retried) => stats.retried += 1,
                Ok(Outcome::Failed) => stats.failed += 1,
                Ok(Outcome::Lost) => {}
                Err(e) => tracing::error!(error = %e, "failed to record job outcome"),
            }
        }
        if stats.claimed > 0 {
            tracing::info!(
                claimed = stats.claimed,
                succeeded = stats.succeeded,
                retried = stats.retried,
                failed = stats.failed,
                "job runner pass complete"
            );
        }
        Ok(stats)
    }

    async fn execute(&self, job: BackgroundJob) -> Result<Outcome, StoreError> {
        let Some(handler) = self.handlers.get(job.job_type.as_str()).cloned() else {
            let msg = format!("no handler registered for {}", job.job_type);
            tracing::error!(job_id = %job.id, job_type = %job.job_type, "{msg}");
            return self.fail(&job, &msg).await;
        };

        tracing::debug!(job_id = %job.id, job_type = %job.job_type, attempt = job.attempts, "running job");
        let result = handler.handle(&job).await;
        self.settle(&job, result).await
    }

    /// Record a handler result: success, terminal failure, or a retry.
    async fn settle(&self, job: &BackgroundJob, result: Result<(), JobError>) -> Result<Outcome, StoreError> {
        let now = self.clock.now();
        match result {
            Ok(()) => {
                if !self.store.mark_succeeded(job.id, now).await? {
                    return Ok(Outcome::Lost);
                }
                tracing::info!(job_id = %job.id, "job succeeded");
                Ok(Outcome::Succeeded)
            }
            Err(JobError::Permanent(msg)) => self.fail(job, &msg).await,
            Err(e) if job.attempts_exhausted() => self.fail(job, &e.to_string()).await,
            Err(JobError::Reschedule { run_at, reason }) => self.retry_at(job, run_at.max(now), &reason).await,
            Err(JobError::Failed(msg)) => {
                self.retry_at(job, now + self.retry.backoff(job.attempts), &msg).await
            }
        }
    }

    async fn retry_at(
        &self,
        job: &BackgroundJob,
        run_at: chrono::DateTime<chrono::Utc>,
        error: &str,
    ) -> Result<Outcome, StoreError> {
        if !self.store.reschedule(job.id, run_at, error, self.clock.now()).await? {
            return Ok(Outcome::Lost);
        }
        tracing::warn!(
            job_id = %job.id,
            attempts = job.attempts,
            max_attempts = job.max_attempts,
            %run_at,
            error,
            "job failed, rescheduled"
        );
        Ok(Outcome::Retried)
    }

    async fn fail(&self, job: &BackgroundJob, error: &str) -> Result<Outcome, StoreError> {
        if !self.store.mark_failed(job.id, error, self.clock.now()).await? {
            return Ok(Outcome::Lost);
        }
        tracing::error!(job_id = %job.id, attempts = job.attempts, error, "job failed terminally");
        Ok(Outcome::Failed)
    }

    /// Poll for due jobs until cancelled.
    pub fn spawn(self, batch_size: usize, poll: Duration, cancel: CancellationToken) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            loop {
                if let Err(e) = self.run_due(batch_size).await {
                    tracing::warn!(error = %e, "job runner pass failed");
                }
                tokio::select! {
                    _ = cancel.cancelled() => {
                        tracing::info!("job runner shutting down");
                        return;
                    }
                    _ = tokio::time::sleep(poll) => {}
                }
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::jobs::queue::JobQueue;
    use crate::jobs::store::InMemoryJobStore;
    use crate::types::JobStatus;
    use std::sync::Mutex;

    /// Handler that pops scripted results; succeeds once the script is empty.
    struct Scripted {
        results: Mutex<Vec<Result<(), JobError>>>,
    }

    impl Scripted {
        fn new(mut results: Vec<Result<(), JobError>>) -> Arc<Self> {
            results.reverse();
            Arc::new(Self { results: Mutex::new(results) })
        }
    }

    #[async_trait]
    impl JobHandler for Scripted {
        fn job_type(&self) -> &'static str {
            "TEST"
        }

        async fn handle(&self, _job: &BackgroundJob) -> Result<(), JobError> {
            self.results.lock().unwrap().pop().unwrap_or(Ok(()))
        }
    }

    async fn setup(
        handler: Arc<Scripted>,
        max_attempts: i32,
    ) -> (JobRunner, Arc<InMemoryJobStore>, ManualClock, uuid::Uuid) {
        let store = Arc::new(InMemoryJobStore::new());
        let clock = ManualClock::default();
        let queue = JobQueue::new(store.clone(), Arc::new(clock.clone()), 5);
        queue.enqueue("TEST", "w", "l", "m", None, Some(max_attempts)).await.unwrap();
        let id = store.get_by_dedupe_key("w:m:TEST").await.unwrap().unwrap().id;
        let mut runner = JobRunner::new(store.clone(), Arc::new(clock.clone()));
        runner.register(handler);
        (runner, store, clock, id)
    }

    #[tokio::test]
    async fn success_marks_succeeded() {
        let (runner, store, _, id) = setup(Scripted::new(vec![]), 3).await;
        let stats = runner.run_due(10).await.unwrap();
        assert_eq!(stats.succeeded, 1);
        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Succeeded);
        assert_eq!(job.attempts, 1);
    }

    #[tokio::test]
    async fn failure_backs_off_then_fails_terminally() {
        let handler = Scripted::new(vec![
            Err(JobError::Failed("boom".into())),
            Err(JobError::Failed("boom".into())),
        ]);
        let (runner, store, clock, id) = setup(handler, 2).await;

        assert_eq!(runner.run_due(10).await.unwrap().retried, 1);
        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.run_at - clock.now(), ChronoDuration::seconds(30));

        // Not due yet.
        assert_eq!(runner.run_due(10).await.unwrap().claimed, 0);

        clock.advance(ChronoDuration::seconds(31));
        assert_eq!(runner.run_due(10).await.unwrap().failed, 1);
        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempts, 2);
        assert_eq!(job.last_error.as_deref(), Some("boom"));
    }

    #[tokio::test]
    async fn reschedule_uses_requested_time() {
        let (runner, store, clock, id) = setup(Scripted::new(vec![]), 3).await;
        let at = clock.now() + ChronoDuration::seconds(7);
        let handler = Scripted::new(vec![Err(JobError::Reschedule { run_at: at, reason: "rate limited".into() })]);
        let mut runner = runner;
        runner.register(handler);

        runner.run_due(10).await.unwrap();
        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.run_at, at);
    }

    #[tokio::test]
    async fn permanent_error_is_not_retried() {
        let handler = Scripted::new(vec![Err(JobError::Permanent("bad input".into()))]);
        let (runner, store, _, id) = setup(handler, 5).await;
        assert_eq!(runner.run_due(10).await.unwrap().failed, 1);
        assert_eq!(store.get(id).await.unwrap().unwrap().status, JobStatus::Failed);
    }

    #[tokio::test]
    async fn unknown_job_type_fails() {
        let store = Arc::new(InMemoryJobStore::new());
        let clock = Arc::new(ManualClock::default());
        JobQueue::new(store.clone(), clock.clone(), 5)
            .enqueue("MYSTERY", "w", "l", "m", None, None)
            .await
            .unwrap();
        let runner = JobRunner::new(store.clone(), clock);
        assert_eq!(runner.run_due(10).await.unwrap().failed, 1);
    }

    struct Panicking {
        calls: std::sync::atomic::AtomicUsize,
    }

    #[async_trait]
    impl JobHandler for Panicking {
        fn job_type(&self) -> &'static str {
            "TEST"
        }

        async fn handle(&self, _job: &BackgroundJob) -> Result<(), JobError> {
            self.calls.fetch_add(1, std::sync::atomic::Ordering::SeqCst);
            panic!("handler blew up");
        }
    }

    #[tokio::test]
    async fn panicking_handler_stops_at_max_attempts() {
        let (mut runner, store, clock, id) = setup(Scripted::new(vec![]), 2).await;
        let handler = Arc::new(Panicking { calls: Default::default() });
        runner.register(handler.clone());

        assert_eq!(runner.run_due(10).await.unwrap().retried, 1);
        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert!(job.last_error.unwrap().contains("handler panicked"));

        for _ in 0..4 {
            clock.advance(ChronoDuration::hours(1));
            runner.run_due(10).await.unwrap();
        }
        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempts, 2);
        assert_eq!(handler.calls.load(std::sync::atomic::Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn abandoned_final_attempt_fails_on_requeue() {
        let (runner, store, clock, id) = setup(Scripted::new(vec![]), 1).await;
        // A crashed worker claimed the job and never reported back.
        store.claim_due(clock.now(), 1).await.unwrap();

        clock.advance(ChronoDuration::hours(1));
        let stats = runner.run_due(10).await.unwrap();
        assert_eq!(stats.requeued, 1);
        assert_eq!(stats.claimed, 0);
        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.last_error.as_deref(), Some(crate::jobs::STALE_EXHAUSTED));
    }

    #[tokio::test]
    async fn racing_runners_never_share_a_job() {
        let (runner, _, _, _) = setup(Scripted::new(vec![]), 3).await;
        let other = runner.clone();
        let (a, b) = tokio::join!(runner.run_due(10), other.run_due(10));
        assert_eq!(a.unwrap().claimed + b.unwrap().claimed, 1);
    }
}
