//! Lease-based distributed locks
//!
//! At-most-one-holder under the assumption that the underlying lease or
//! fencing primitive is safe. Holders must refresh on a cadence of `ttl/2`;
//! a failed refresh means the lock is gone and the holder must stop.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use thiserror::Error;
use uuid::Uuid;

/// Errors surfaced by lock operations
#[derive(Debug, Error)]
pub enum LockError {
    /// The lease expired or another holder took over. Not retryable; the
    /// worker must stop itself.
    #[error("lock '{0}' was lost")]
    Lost(String),

    #[error("transient lock error: {0}")]
    Transient(String),

    #[error("lock error: {0}")]
    Other(String),
}

/// Result type for lock operations
pub type LockResult<T> = std::result::Result<T, LockError>;

/// A held lease. Dropping does not release; call [`release`](Lease::release).
#[async_trait]
pub trait Lease: Send + Sync {
    /// Extend the lease before expiry.
    async fn refresh(&self) -> LockResult<()>;

    /// Give the lock up.
    async fn release(&self) -> LockResult<()>;
}

/// Lock acquisition capability.
#[async_trait]
pub trait Locker: Send + Sync {
    /// Try to take the named lock for `ttl`. `None` when another holder has
    /// it.
    async fn acquire(&self, name: &str, ttl: Duration) -> LockResult<Option<Arc<dyn Lease>>>;
}

#[derive(Debug, Clone)]
struct Held {
    holder: Uuid,
    expires_at: Instant,
}

/// Process-local lock service for the in-process wiring and tests.
///
/// Clones share the same lock table, so separate "instances" in one process
/// contend correctly.
#[derive(Clone, Default)]
pub struct MemoryLocks {
    table: Arc<Mutex<HashMap<String, Held>>>,
}

impl MemoryLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current holder of a lock, if the lease is still live.
    pub fn holder(&self, name: &str) -> Option<Uuid> {
        let table = self.table.lock().expect("lock table poisoned");
        table
            .get(name)
            .filter(|held| held.expires_at > Instant::now())
            .map(|held| held.holder)
    }
}

#[async_trait]
impl Locker for MemoryLocks {
    async fn acquire(&self, name: &str, ttl: Duration) -> LockResult<Option<Arc<dyn Lease>>> {
        let holder = Uuid::now_v7();
        let mut table = self.table.lock().expect("lock table poisoned");
        if let Some(held) = table.get(name) {
            if held.expires_at > Instant::now() {
                return Ok(None);
            }
        }
        table.insert(
            name.to_string(),
            Held {
                holder,
                expires_at: Instant::now() + ttl,
            },
        );
        Ok(Some(Arc::new(MemoryLease {
            table: self.table.clone(),
            name: name.to_string(),
            holder,
            ttl,
        })))
    }
}

struct MemoryLease {
    table: Arc<Mutex<HashMap<String, Held>>>,
    name: String,
    holder: Uuid,
    ttl: Duration,
}

#[async_trait]
impl Lease for MemoryLease {
    async fn refresh(&self) -> LockResult<()> {
        let mut table = self.table.lock().expect("lock table poisoned");
        match table.get_mut(&self.name) {
            Some(held) if held.holder == self.holder && held.expires_at > Instant::now() => {
                held.expires_at = Instant::now() + self.ttl;
                Ok(())
            }
            _ => Err(LockError::Lost(self.name.clone())),
        }
    }

    async fn release(&self) -> LockResult<()> {
        let mut table = self.table.lock().expect("lock table poisoned");
        if let Some(held) = table.get(&self.name) {
            if held.holder == self.holder {
                table.remove(&self.name);
            }
        }
        Ok(())
    }
}
