//! Named advisory locks.
//!
//! `OperationLog` serializes every critical section that reads the entity
//! frontier and then mutates the log: remote-op detection and resolution,
//! local capture, stale-op resolution and compaction. `Upload` keeps two
//! uploads from interleaving. Locks are not re-entrant.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::trace;

/// Names of the engine's advisory locks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum LockName {
    OperationLog,
    Upload,
}

impl LockName {
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            LockName::OperationLog => "OPERATION_LOG",
            LockName::Upload => "UPLOAD",
        }
    }
}

/// A held named lock. Released on drop.
pub struct LockGuard {
    name: LockName,
    _guard: OwnedMutexGuard<()>,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        trace!("released lock {}", self.name.as_str());
    }
}

/// Hands out the engine's named locks.
pub struct LockService {
    locks: HashMap<LockName, Arc<Mutex<()>>>,
}

impl LockService {
    #[must_use]
    pub fn new() -> Self {
        let locks = [LockName::OperationLog, LockName::Upload]
            .into_iter()
            .map(|name| (name, Arc::new(Mutex::new(()))))
            .collect();
        Self { locks }
    }

    /// Waits for and acquires the named lock.
    pub async fn acquire(&self, name: LockName) -> LockGuard {
        let mutex = self
            .locks
            .get(&name)
            .cloned()
            .unwrap_or_else(|| Arc::new(Mutex::new(())));
        let guard = mutex.lock_owned().await;
        trace!("acquired lock {}", name.as_str());
        LockGuard {
            name,
            _guard: guard,
        }
    }

    /// Whether the named lock is currently held.
    #[must_use]
    pub fn is_locked(&self, name: LockName) -> bool {
        self.locks
            .get(&name)
            .is_some_and(|m| m.try_lock().is_err())
    }
}

impl Default for LockService {
    fn default() -> Self {
        Self::new()
    }
}
