//! Member list: who is alive and what they own
//!
//! Each process registers its claimed worker names as a heartbeat and
//! enumerates its peers. The core only requires eventually-consistent
//! enumeration with TTL-bounded staleness of a peer's claim.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Errors surfaced by member-list operations
#[derive(Debug, Error)]
pub enum MemberError {
    #[error("transient member list error: {0}")]
    Transient(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("member list error: {0}")]
    Other(String),
}

/// Result type for member-list operations
pub type MemberResult<T> = std::result::Result<T, MemberError>;

/// One peer and the worker names it currently claims.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberWorkers {
    pub name: String,
    pub workers: Vec<String>,
}

/// Membership capability of one process.
#[async_trait]
pub trait MemberList: Send + Sync {
    /// This process's identity.
    fn name(&self) -> &str;

    /// Current membership with each peer's claimed worker names.
    async fn list(&self) -> MemberResult<Vec<MemberWorkers>>;

    /// Publish this process's claim as a heartbeat.
    async fn register(&self, workers: &[String]) -> MemberResult<()>;
}

#[derive(Debug, Clone)]
struct Registration {
    workers: Vec<String>,
    seen_at: Instant,
}

/// Shared in-process registry backing [`MemoryMembers`] handles.
///
/// Entries older than the TTL are treated as departed, mirroring the
/// staleness bound of an external registry.
#[derive(Clone)]
pub struct MemberRegistry {
    entries: Arc<Mutex<HashMap<String, Registration>>>,
    ttl: Duration,
}

impl MemberRegistry {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: Arc::new(Mutex::new(HashMap::new())),
            ttl,
        }
    }

    /// Create a membership handle for a new process identity.
    pub fn join(&self) -> MemoryMembers {
        MemoryMembers {
            registry: self.clone(),
            name: format!("member-{}", Uuid::now_v7()),
        }
    }

    /// Drop a member immediately, as if its TTL had elapsed.
    pub fn evict(&self, name: &str) {
        self.entries
            .lock()
            .expect("member registry poisoned")
            .remove(name);
    }

    fn snapshot(&self) -> Vec<MemberWorkers> {
        let mut entries = self.entries.lock().expect("member registry poisoned");
        let now = Instant::now();
        entries.retain(|_, r| now.duration_since(r.seen_at) < self.ttl);
        let mut members: Vec<MemberWorkers> = entries
            .iter()
            .map(|(name, r)| MemberWorkers {
                name: name.clone(),
                workers: r.workers.clone(),
            })
            .collect();
        members.sort_by(|a, b| a.name.cmp(&b.name));
        members
    }

    fn record(&self, name: &str, workers: &[String]) {
        self.entries
            .lock()
            .expect("member registry poisoned")
            .insert(
                name.to_string(),
                Registration {
                    workers: workers.to_vec(),
                    seen_at: Instant::now(),
                },
            );
    }
}

/// In-process member list handle.
pub struct MemoryMembers {
    registry: MemberRegistry,
    name: String,
}

#[async_trait]
impl MemberList for MemoryMembers {
    fn name(&self) -> &str {
        &self.name
    }

    async fn list(&self) -> MemberResult<Vec<MemberWorkers>> {
        Ok(self.registry.snapshot())
    }

    async fn register(&self, workers: &[String]) -> MemberResult<()> {
        self.registry.record(&self.name, workers);
        Ok(())
    }
}
