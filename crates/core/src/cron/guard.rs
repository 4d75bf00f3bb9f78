//! Non-blocking, key-scoped mutual exclusion for periodic tasks.
//!
//! A second invocation of the same task while the first still holds the lock
//! is skipped, never queued.

use std::collections::HashSet;
use std::future::Future;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use sha2::{Digest, Sha256};
use sqlx::pool::PoolConnection;
use sqlx::{PgPool, Postgres};

use crate::error::{StoreError, poisoned};

/// Stable 64-bit lock key for a task name.
pub fn lock_key(task: &str) -> i64 {
    let digest = Sha256::digest(format!("outreach-cron:{task}").as_bytes());
    let mut head = [0u8; 8];
    head.copy_from_slice(&digest[..8]);
    i64::from_be_bytes(head)
}

/// Source of try-locks.
#[async_trait]
pub trait AdvisoryLocks: Send + Sync {
    /// Try to take `key` without waiting. `None` means someone else holds it.
    async fn try_acquire(&self, key: i64) -> Result<Option<LockHandle>, StoreError>;
}

enum Held {
    /// Session-level lock pinned to this connection.
    Pg(PoolConnection<Postgres>),
    Memory(Arc<Mutex<HashSet<i64>>>),
    Released,
}

/// A held lock. Dropping it without [`release`](Self::release) still frees
/// the lock: the Postgres connection is closed rather than returned to the
/// pool, which ends the session that owns it.
pub struct LockHandle {
    key: i64,
    held: Held,
}

impl LockHandle {
    pub fn key(&self) -> i64 {
        self.key
    }

    pub async fn release(mut self) -> Result<(), StoreError> {
        match std::mem::replace(&mut self.held, Held::Released) {
            Held::Pg(mut conn) => {
                let unlocked: Result<(bool,), sqlx::Error> =
                    sqlx::query_as("SELECT pg_advisory_unlock($1)")
                        .bind(self.key)
                        .fetch_one(&mut *conn)
                        .await;
                match unlocked {
                    Ok((true,)) => Ok(()),
                    Ok((false,)) => {
                        drop(conn.detach());
                        Err(StoreError::Unavailable(format!("advisory lock {} was not held", self.key)))
                    }
                    Err(e) => {
                        drop(conn.detach());
                        Err(e.into())
                    }
                }
            }
            Held::Memory(set) => {
                set.lock().map_err(poisoned)?.remove(&self.key);
                Ok(())
            }
            Held::Released => Ok(()),
        }
    }
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        match std::mem::replace(&mut self.held, Held::Released) {
            Held::Pg(conn) => {
                tracing::warn!(key = self.key, "advisory lock dropped unreleased, closing its session");
                drop(conn.detach());
            }
            Held::Memory(set) => {
                if let Ok(mut set) = set.lock() {
                    set.remove(&self.key);
                }
            }
            Held::Released => {}
        }
    }
}

/// Postgres session-level advisory locks.
#[derive(Debug, Clone)]
pub struct PgAdvisoryLocks {
    pool: PgPool,
}

impl PgAdvisoryLocks {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl AdvisoryLocks for PgAdvisoryLocks {
    async fn try_acquire(&self, key: i64) -> Result<Option<LockHandle>, StoreError> {
        let mut conn = self.pool.acquire().await?;
        let (locked,): (bool,) = sqlx::query_as("SELECT pg_try_advisory_lock($1)")
            .bind(key)
            .fetch_one(&mut *conn)
            .await?;
        Ok(locked.then(|| LockHandle { key, held: Held::Pg(conn) }))
    }
}

/// Process-local locks for tests and ephemeral mode.
#[derive(Debug, Clone, Default)]
pub struct InMemoryLocks {
    held: Arc<Mutex<HashSet<i64>>>,
}

impl InMemoryLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_held(&self, key: i64) -> bool {
        self.held.lock().map(|h| h.contains(&key)).unwrap_or(false)
    }
}

#[async_trait]
impl AdvisoryLocks for InMemoryLocks {
    async fn try_acquire(&self, key: i64) -> Result<Option<LockHandle>, StoreError> {
        let mut held = self.held.lock().map_err(poisoned)?;
        if !held.insert(key) {
            return Ok(None);
        }
        Ok(Some(LockHandle { key, held: Held::Memory(self.held.clone()) }))
    }
}

/// Whether a guarded task ran.
#[derive(Debug, PartialEq, Eq)]
pub enum Guarded<T> {
    Ran(T),
    /// Another invocation held the lock.
    Skipped,
}

/// Runs periodic tasks under their advisory lock.
#[derive(Clone)]
pub struct CronGuard {
    locks: Arc<dyn AdvisoryLocks>,
}

impl CronGuard {
    pub fn new(locks: Arc<dyn AdvisoryLocks>) -> Self {
        Self { locks }
    }

    /// Run `task` if its lock is free. The lock is released after the task
    /// finishes, whatever it returns; a panic or cancellation releases it
    /// through the handle's `Drop`.
    pub async fn run<F, Fut, T>(&self, task: &str, f: F) -> Result<Guarded<T>, StoreError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        let key = lock_key(task);
        let Some(handle) = self.locks.try_acquire(key).await? else {
            tracing::info!(task, "cron task already running elsewhere, skipping");
            return Ok(Guarded::Skipped);
        };
        let out = f().await;
        if let Err(e) = handle.release().await {
            tracing::warn!(task, error = %e, "failed to release cron lock");
        }
        Ok(Guarded::Ran(out))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_keys_are_stable_and_distinct() {
        assert_eq!(lock_key("prune"), lock_key("prune"));
        assert_ne!(lock_key("prune"), lock_key("stale-drafts"));
    }

    #[tokio::test]
    async fn overlapping_invocation_is_skipped() {
        let locks = InMemoryLocks::new();
        let guard = CronGuard::new(Arc::new(locks.clone()));
        let key = lock_key("sweep");

        let outer = guard
            .run("sweep", || async {
                assert!(locks.is_held(key));
                guard.run("sweep", || async { "inner" }).await.unwrap()
            })
            .await
            .unwrap();
        assert_eq!(outer, Guarded::Ran(Guarded::Skipped));
        assert!(!locks.is_held(key));
    }

    #[tokio::test]
    async fn lock_released_when_task_fails() {
        let locks = InMemoryLocks::new();
        let guard = CronGuard::new(Arc::new(locks.clone()));
        let out = guard
            .run("sweep", || async { Err::<(), _>("boom") })
            .await
            .unwrap();
        assert_eq!(out, Guarded::Ran(Err("boom")));
        assert!(!locks.is_held(lock_key("sweep")));
    }

    #[tokio::test]
    async fn lock_released_when_task_is_cancelled() {
        let locks = InMemoryLocks::new();
        let guard = CronGuard::new(Arc::new(locks.clone()));
        let pending = guard.run("sweep", || std::future::pending::<()>());
        let timed_out = tokio::time::timeout(std::time::Duration::from_millis(10), pending).await;
        assert!(timed_out.is_err());
        assert!(!locks.is_held(lock_key("sweep")));
    }

    #[tokio::test]
    async fn different_tasks_do_not_contend() {
        let locks = InMemoryLocks::new();
        let guard = CronGuard::new(Arc::new(locks));
        let out = guard
            .run("a", || async { guard.run("b", || async { 1 }).await.unwrap() })
            .await
            .unwrap();
        assert_eq!(out, Guarded::Ran(Guarded::Ran(1)));
    }
}
