//! Durable, deduplicated background jobs and the runner that executes them.

pub mod db;
pub mod queue;
pub mod runner;
pub mod store;
pub mod types;

pub use queue::{JobQueue, build_dedupe_key};
pub use runner::{JobHandler, JobRunner};
pub use store::{InMemoryJobStore, JobStore, STALE_EXHAUSTED};
pub use types::{BackgroundJob, EnqueueOutcome, JobError, NewJob, RetryPolicy, RunStats, AI_DRAFT_PIPELINE};
