use std::fmt;
use std::sync::Arc;

use tracing::warn;

use crate::error::Result;
use crate::traits::{FlowLock, LockProvider};

const KEY_PREFIX: &str = "waterflow";

/// Phase component of a node-scoped lock key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockPhase {
    /// Admission of contexts into a node's jober, by live traffic or retries.
    Admission,
    /// Completion of an async dispatch at a node.
    Resume,
}

impl fmt::Display for LockPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LockPhase::Admission => f.write_str("admission"),
            LockPhase::Resume => f.write_str("resume"),
        }
    }
}

/// Lock key for one retry batch.
pub fn retry_batch_key(batch: &str) -> String {
    format!("{KEY_PREFIX}:retry:{batch}")
}

/// Lock key for node-level admission at `(stream, position, phase)`.
pub fn node_key(stream_id: &str, position: &str, phase: LockPhase) -> String {
    format!("{KEY_PREFIX}:node:{stream_id}:{position}:{phase}")
}

/// A held lock that is released when dropped.
pub struct HeldLock {
    key: String,
    lock: Arc<dyn FlowLock>,
    released: bool,
}

impl HeldLock {
    /// Non-blocking acquisition. `Ok(None)` when someone else holds the key.
    pub fn try_acquire(provider: &dyn LockProvider, key: &str) -> Result<Option<Self>> {
        let lock = provider.distributed_lock(key);
        if lock.try_lock()? {
            Ok(Some(Self {
                key: key.to_string(),
                lock,
                released: false,
            }))
        } else {
            Ok(None)
        }
    }

    /// Wait until the key is free, then hold it.
    pub async fn acquire(provider: &dyn LockProvider, key: &str) -> Result<Self> {
        let lock = provider.distributed_lock(key);
        lock.lock().await?;
        Ok(Self {
            key: key.to_string(),
            lock,
            released: false,
        })
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn release(mut self) -> Result<()> {
        self.released = true;
        self.lock.unlock()
    }
}

impl Drop for HeldLock {
    fn drop(&mut self) {
        if !self.released {
            if let Err(e) = self.lock.unlock() {
                warn!(key = %self.key, error = %e, "Failed to release lock");
            }
        }
    }
}
