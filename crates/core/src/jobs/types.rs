use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::types::JobStatus;

/// Job type that runs the draft pipeline for one inbound message.
pub const AI_DRAFT_PIPELINE: &str = "AI_DRAFT_PIPELINE";

/// Durable unit of background work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BackgroundJob {
    pub id: Uuid,
    pub job_type: String,
    pub workspace_id: String,
    pub lead_id: String,
    pub message_id: String,
    pub dedupe_key: String,
    pub status: JobStatus,
    /// Claims so far. Incremented when the runner claims the job.
    pub attempts: i32,
    pub max_attempts: i32,
    pub run_at: DateTime<Utc>,
    pub last_error: Option<String>,
    pub locked_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl BackgroundJob {
    pub fn attempts_exhausted(&self) -> bool {
        self.attempts >= self.max_attempts
    }
}

/// Enqueue request.
#[derive(Debug, Clone)]
pub struct NewJob {
    pub job_type: String,
    pub workspace_id: String,
    pub lead_id: String,
    pub message_id: String,
    pub dedupe_key: String,
    pub run_at: DateTime<Utc>,
    pub max_attempts: i32,
}

/// Result of an enqueue. `enqueued == false` means a job with the same
/// dedupe key already exists.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnqueueOutcome {
    pub enqueued: bool,
    pub dedupe_key: String,
}

/// Exponential backoff used when a handler fails without asking for a
/// specific retry time.
#[derive(Debug, Clone, Copy)]
pub struct RetryPolicy {
    pub base: Duration,
    pub max: Duration,
}

impl RetryPolicy {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self { base, max }
    }

    /// Delay after the given (1-based) attempt: `base * 2^(attempt-1)`, capped.
    pub fn backoff(&self, attempt: i32) -> Duration {
        let exp = (attempt.max(1) - 1).min(30) as u32;
        let secs = self.base.num_seconds().saturating_mul(1i64 << exp);
        Duration::seconds(secs).min(self.max)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self { base: Duration::seconds(30), max: Duration::seconds(3600) }
    }
}

/// Handler outcome other than success.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    /// Retry at an explicit time instead of the backoff curve.
    #[error("reschedule requested for {run_at}: {reason}")]
    Reschedule { run_at: DateTime<Utc>, reason: String },
    /// Transient failure, retried with backoff while attempts remain.
    #[error("{0}")]
    Failed(String),
    /// Never retried.
    #[error("permanent failure: {0}")]
    Permanent(String),
}

/// Counters from one runner pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RunStats {
    pub requeued: u64,
    pub claimed: usize,
    pub succeeded: usize,
    pub retried: usize,
    pub failed: usize,
}
