//! Periodic tasks: authorization, overlap guard, maintenance and dispatch.

pub mod auth;
pub mod guard;
pub mod maintenance;
pub mod trigger;

pub use auth::{CronAuth, CronAuthError, CronCredentials, SECRET_HEADER};
pub use guard::{AdvisoryLocks, CronGuard, Guarded, InMemoryLocks, LockHandle, PgAdvisoryLocks, lock_key};
pub use maintenance::{Maintenance, PruneReport, PruneThrottle};
pub use trigger::{CronResponse, CronTask, CronTrigger};
