use std::sync::{Arc, Mutex};

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;

use crate::clock::Clock;
use crate::error::{StoreError, poisoned};
use crate::jobs::JobStore;
use crate::pipeline::PipelineStore;

/// Minimum spacing between prune passes within one process. Cross-process
/// overlap is the cron guard's job; this only stops a hot trigger from
/// hammering the tables.
pub struct PruneThrottle {
    clock: Arc<dyn Clock>,
    interval: Duration,
    last_run: Mutex<Option<DateTime<Utc>>>,
}

impl PruneThrottle {
    pub fn new(clock: Arc<dyn Clock>, interval: Duration) -> Self {
        Self { clock, interval, last_run: Mutex::new(None) }
    }

    /// Claim the next pass. Returns false while the interval has not elapsed.
    pub fn try_begin(&self) -> Result<bool, StoreError> {
        let now = self.clock.now();
        let mut last = self.last_run.lock().map_err(poisoned)?;
        if last.is_some_and(|at| now - at < self.interval) {
            return Ok(false);
        }
        *last = Some(now);
        Ok(true)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct PruneReport {
    pub skipped: bool,
    pub jobs_deleted: u64,
    pub artifacts_deleted: u64,
}

/// Retention pruning for finished jobs and finished runs' artifacts.
pub struct Maintenance {
    jobs: Arc<dyn JobStore>,
    pipeline: Arc<dyn PipelineStore>,
    clock: Arc<dyn Clock>,
    retention: Duration,
    throttle: PruneThrottle,
}

impl Maintenance {
    pub fn new(
        jobs: Arc<dyn JobStore>,
        pipeline: Arc<dyn PipelineStore>,
        clock: Arc<dyn Clock>,
        retention: Duration,
        interval: Duration,
    ) -> Self {
        let throttle = PruneThrottle::new(clock.clone(), interval);
        Self { jobs, pipeline, clock, retention, throttle }
    }

    pub async fn prune(&self) -> Result<PruneReport, StoreError> {
        if !self.throttle.try_begin()? {
            tracing::debug!("prune throttled");
            return Ok(PruneReport { skipped: true, ..PruneReport::default() });
        }
        let cutoff = self.clock.now() - self.retention;
        let jobs_deleted = self.jobs.prune_finished(cutoff).await?;
        let artifacts_deleted = self.pipeline.prune_artifacts(cutoff).await?;
        tracing::info!(jobs_deleted, artifacts_deleted, %cutoff, "prune finished");
        Ok(PruneReport { skipped: false, jobs_deleted, artifacts_deleted })
    }
}
