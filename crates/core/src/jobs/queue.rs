use std::sync::Arc;

use chrono::{DateTime, Utc};

use super::store::JobStore;
use super::types::{EnqueueOutcome, NewJob};
use crate::clock::Clock;
use crate::error::StoreError;

/// Deterministic dedupe key: `{workspace_id}:{message_id}:{job_type}`.
pub fn build_dedupe_key(workspace_id: &str, message_id: &str, job_type: &str) -> String {
    format!("{workspace_id}:{message_id}:{job_type}")
}

/// Enqueue front-end that fills in defaults and the dedupe key.
#[derive(Clone)]
pub struct JobQueue {
    store: Arc<dyn JobStore>,
    clock: Arc<dyn Clock>,
    default_max_attempts: i32,
}

impl JobQueue {
    pub fn new(store: Arc<dyn JobStore>, clock: Arc<dyn Clock>, default_max_attempts: i32) -> Self {
        Self { store, clock, default_max_attempts }
    }

    /// Enqueue a job for (workspace, message, type). A second enqueue for the
    /// same triple reports `enqueued: false` and changes nothing.
    pub async fn enqueue(
        &self,
        job_type: &str,
        workspace_id: &str,
        lead_id: &str,
        message_id: &str,
        run_at: Option<DateTime<Utc>>,
        max_attempts: Option<i32>,
    ) -> Result<EnqueueOutcome, StoreError> {
        let now = self.clock.now();
        let job = NewJob {
            job_type: job_type.to_owned(),
            workspace_id: workspace_id.to_owned(),
            lead_id: lead_id.to_owned(),
            message_id: message_id.to_owned(),
            dedupe_key: build_dedupe_key(workspace_id, message_id, job_type),
            run_at: run_at.unwrap_or(now),
            max_attempts: max_attempts.unwrap_or(self.default_max_attempts).max(1),
        };
        let outcome = self.store.enqueue(&job, now).await?;
        if outcome.enqueued {
            tracing::info!(job_type, dedupe_key = %outcome.dedupe_key, "job enqueued");
        } else {
            tracing::debug!(job_type, dedupe_key = %outcome.dedupe_key, "job already enqueued");
        }
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::jobs::store::InMemoryJobStore;

    #[test]
    fn dedupe_key_format() {
        assert_eq!(build_dedupe_key("w1", "m1", "LEAD_SCORING"), "w1:m1:LEAD_SCORING");
    }

    #[tokio::test]
    async fn second_enqueue_is_a_no_op() {
        let store = Arc::new(InMemoryJobStore::new());
        let queue = JobQueue::new(store.clone(), Arc::new(ManualClock::default()), 5);

        let first = queue.enqueue("LEAD_SCORING", "w1", "l1", "m1", None, None).await.unwrap();
        let second = queue.enqueue("LEAD_SCORING", "w1", "l1", "m1", None, Some(9)).await.unwrap();

        assert!(first.enqueued);
        assert!(!second.enqueued);
        assert_eq!(store.len(), 1);
        let job = store.get_by_dedupe_key("w1:m1:LEAD_SCORING").await.unwrap().unwrap();
        assert_eq!(job.max_attempts, 5);
    }

    #[tokio::test]
    async fn different_type_is_a_different_job() {
        let store = Arc::new(InMemoryJobStore::new());
        let queue = JobQueue::new(store.clone(), Arc::new(ManualClock::default()), 5);
        queue.enqueue("A", "w1", "l1", "m1", None, None).await.unwrap();
        queue.enqueue("B", "w1", "l1", "m1", None, None).await.unwrap();
        assert_eq!(store.len(), 2);
    }
}
