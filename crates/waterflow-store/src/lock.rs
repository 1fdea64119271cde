use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use futures::future::BoxFuture;
use rusqlite::{params, Connection};
use tokio::sync::Semaphore;
use tracing::{debug, warn};
use uuid::Uuid;

use waterflow_core::error::{FlowError, Result};
use waterflow_core::traits::{FlowLock, LockProvider};

/// A single-permit lock for one key within this process.
struct LocalLock {
    key: String,
    permit: Semaphore,
}

impl FlowLock for LocalLock {
    fn try_lock(&self) -> Result<bool> {
        match self.permit.try_acquire() {
            Ok(permit) => {
                permit.forget();
                Ok(true)
            }
            Err(_) => Ok(false),
        }
    }

    fn lock(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            let permit = self
                .permit
                .acquire()
                .await
                .map_err(|e| FlowError::Lock(format!("{}: {}", self.key, e)))?;
            permit.forget();
            Ok(())
        })
    }

    fn unlock(&self) -> Result<()> {
        if self.permit.available_permits() > 0 {
            return Err(FlowError::Lock(format!("{} is not held", self.key)));
        }
        self.permit.add_permits(1);
        Ok(())
    }
}

/// Lock provider for a single process. Keys map to shared locks for the
/// provider's lifetime.
#[derive(Default)]
pub struct LocalLockProvider {
    locks: Mutex<HashMap<String, Arc<LocalLock>>>,
}

impl LocalLockProvider {
    pub fn new() -> Self {
        Self::default()
    }
}

impl LockProvider for LocalLockProvider {
    fn distributed_lock(&self, key: &str) -> Arc<dyn FlowLock> {
        let mut locks = match self.locks.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        locks
            .entry(key.to_string())
            .or_insert_with(|| {
                Arc::new(LocalLock {
                    key: key.to_string(),
                    permit: Semaphore::new(1),
                })
            })
            .clone()
    }
}

const POLL_INTERVAL: Duration = Duration::from_millis(50);

/// Default age after which a lock row counts as abandoned.
pub const DEFAULT_LEASE: Duration = Duration::from_secs(300);

/// A lock row in the `flow_locks` table.
struct SqliteLock {
    conn: Arc<Mutex<Connection>>,
    key: String,
    owner: String,
    lease: Duration,
}

impl FlowLock for SqliteLock {
    fn try_lock(&self) -> Result<bool> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| FlowError::Database(e.to_string()))?;
        let now = Utc::now().timestamp_millis();
        let inserted = conn
            .execute(
                "INSERT OR IGNORE INTO flow_locks (key, owner, acquired_at) VALUES (?1, ?2, ?3)",
                params![self.key, self.owner, now],
            )
            .map_err(|e| FlowError::Database(e.to_string()))?;
        if inserted == 1 {
            return Ok(true);
        }

        // A row older than the lease belongs to a holder that never let go.
        let stale_before = now - self.lease.as_millis() as i64;
        let taken = conn
            .execute(
                "UPDATE flow_locks SET owner = ?1, acquired_at = ?2 WHERE key = ?3 AND acquired_at < ?4",
                params![self.owner, now, self.key, stale_before],
            )
            .map_err(|e| FlowError::Database(e.to_string()))?;
        if taken == 1 {
            warn!(key = %self.key, owner = %self.owner, "Took over stale lock");
        }
        Ok(taken == 1)
    }

    fn lock(&self) -> BoxFuture<'_, Result<()>> {
        Box::pin(async move {
            while !self.try_lock()? {
                tokio::time::sleep(POLL_INTERVAL).await;
            }
            Ok(())
        })
    }

    fn unlock(&self) -> Result<()> {
        let conn = self
            .conn
            .lock()
            .map_err(|e| FlowError::Database(e.to_string()))?;
        let deleted = conn
            .execute(
                "DELETE FROM flow_locks WHERE key = ?1 AND owner = ?2",
                params![self.key, self.owner],
            )
            .map_err(|e| FlowError::Database(e.to_string()))?;
        if deleted == 0 {
            return Err(FlowError::Lock(format!("{} is not held by this owner", self.key)));
        }
        Ok(())
    }
}

/// Lock provider backed by the `flow_locks` table, shared by every
/// process using the same database file. Rows older than the lease are
/// taken over, so a crashed holder cannot block a key forever.
pub struct SqliteLockProvider {
    conn: Arc<Mutex<Connection>>,
    owner: String,
    lease: Duration,
}

impl SqliteLockProvider {
    pub(crate) fn new(conn: Arc<Mutex<Connection>>) -> Self {
        let owner = Uuid::new_v4().to_string();
        debug!(owner = %owner, "SQLite lock provider created");
        Self {
            conn,
            owner,
            lease: DEFAULT_LEASE,
        }
    }

    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }
}

impl LockProvider for SqliteLockProvider {
    fn distributed_lock(&self, key: &str) -> Arc<dyn FlowLock> {
        Arc::new(SqliteLock {
            conn: self.conn.clone(),
            key: key.to_string(),
            owner: self.owner.clone(),
            lease: self.lease,
        })
    }
}
