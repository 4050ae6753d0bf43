//! Single-flight guards around the sync entry point.

use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Context;
use async_trait::async_trait;
use sqlx::pool::PoolConnection;
use sqlx::{PgPool, Postgres};
use tokio::sync::Mutex;
use tracing::warn;

/// Advisory lock key shared by every process running the lead sync.
pub const LEAD_SYNC_LOCK_KEY: i64 = 0x7670_6f5f_7379_6e63;

#[async_trait]
pub trait RunLock: Send + Sync {
    /// `Ok(false)` when another run holds the lock.
    async fn try_acquire(&self) -> anyhow::Result<bool>;
    async fn release(&self) -> anyhow::Result<()>;
    /// Synchronous release for a run that was dropped before it could call
    /// [`RunLock::release`].
    fn abandon(&self);
}

/// A held [`RunLock`]. Dropping it without [`RunLockGuard::release`], as a
/// cancelled or panicking run does, abandons the lock.
pub struct RunLockGuard<'a> {
    lock: &'a dyn RunLock,
    released: bool,
}

impl<'a> RunLockGuard<'a> {
    /// `Ok(None)` when another run holds the lock.
    pub async fn acquire(lock: &'a dyn RunLock) -> anyhow::Result<Option<Self>> {
        Ok(lock.try_acquire().await?.then_some(Self {
            lock,
            released: false,
        }))
    }

    pub async fn release(mut self) -> anyhow::Result<()> {
        let result = self.lock.release().await;
        self.released = true;
        result
    }
}

impl Drop for RunLockGuard<'_> {
    fn drop(&mut self) {
        if !self.released {
            self.lock.abandon();
        }
    }
}

/// In-process guard for tests and single-binary deployments.
#[derive(Debug, Default)]
pub struct LocalRunLock {
    held: AtomicBool,
}

impl LocalRunLock {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_held(&self) -> bool {
        self.held.load(Ordering::Acquire)
    }
}

#[async_trait]
impl RunLock for LocalRunLock {
    async fn try_acquire(&self) -> anyhow::Result<bool> {
        Ok(self
            .held
            .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
            .is_ok())
    }

    async fn release(&self) -> anyhow::Result<()> {
        self.held.store(false, Ordering::Release);
        Ok(())
    }

    fn abandon(&self) {
        self.held.store(false, Ordering::Release);
    }
}

/// Session-level `pg_try_advisory_lock`, held on a dedicated pooled
/// connection until [`RunLock::release`].
pub struct PgAdvisoryRunLock {
    pool: PgPool,
    key: i64,
    conn: Mutex<Option<PoolConnection<Postgres>>>,
}

impl PgAdvisoryRunLock {
    pub fn new(pool: PgPool) -> Self {
        Self::with_key(pool, LEAD_SYNC_LOCK_KEY)
    }

    pub fn with_key(pool: PgPool, key: i64) -> Self {
        Self {
            pool,
            key,
            conn: Mutex::new(None),
        }
    }
}

#[async_trait]
impl RunLock for PgAdvisoryRunLock {
    async fn try_acquire(&self) -> anyhow::Result<bool> {
        let mut slot = self.conn.lock().await;
        if slot.is_some() {
            return Ok(false);
        }
        let mut conn = self
            .pool
            .acquire()
            .await
            .context("acquiring connection for sync lock")?;
        let acquired: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
            .bind(self.key)
            .fetch_one(&mut *conn)
            .await
            .context("taking sync advisory lock")?;
        if acquired {
            *slot = Some(conn);
        }
        Ok(acquired)
    }

    async fn release(&self) -> anyhow::Result<()> {
        let mut slot = self.conn.lock().await;
        let Some(held) = slot.as_mut() else {
            return Ok(());
        };
        let unlocked = sqlx::query_scalar::<_, bool>("SELECT pg_advisory_unlock($1)")
            .bind(self.key)
            .fetch_one(&mut **held)
            .await;
        let Some(conn) = slot.take() else {
            return Ok(());
        };
        match unlocked {
            Ok(true) => Ok(()),
            Ok(false) => {
                warn!(key = self.key, "sync advisory lock was not held at release");
                Ok(())
            }
            Err(err) => {
                // Closing the session drops any advisory locks it still holds.
                drop(conn.detach());
                Err(err).context("releasing sync advisory lock")
            }
        }
    }

    fn abandon(&self) {
        match self.conn.try_lock() {
            Ok(mut slot) => {
                if let Some(conn) = slot.take() {
                    drop(conn.detach());
                    warn!(key = self.key, "sync run dropped while holding the advisory lock; session closed");
                }
            }
            Err(_) => warn!(key = self.key, "sync advisory lock slot busy; lock not abandoned"),
        }
    }
}
