//! NATS KV-backed lease locks
//!
//! Each lock is one key whose value records the holder and expiry; the KV
//! revision is the fencing token. Create-if-absent takes a free lock,
//! compare-and-swap on the revision takes over an expired one and guards
//! every refresh, so a holder that lost the key learns it on the next
//! refresh and stops.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_nats::jetstream::{self, kv};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;
use uuid::Uuid;

use eventline::worker::lock::{Lease, LockError, LockResult, Locker};

use crate::error::{NatsError, NatsResult};

#[derive(Debug, Serialize, Deserialize)]
struct LeaseRecord {
    holder: Uuid,
    expires_at: DateTime<Utc>,
}

/// KV-backed lock service.
pub struct KvLocker {
    store: kv::Store,
}

impl KvLocker {
    pub async fn new(client: async_nats::Client, bucket: impl Into<String>) -> NatsResult<Self> {
        let jetstream = jetstream::new(client);
        let store = jetstream
            .create_key_value(kv::Config {
                bucket: bucket.into(),
                history: 1,
                ..Default::default()
            })
            .await
            .map_err(|e| NatsError::KvStore(e.to_string()))?;
        Ok(Self { store })
    }
}

#[async_trait]
impl Locker for KvLocker {
    async fn acquire(&self, name: &str, ttl: Duration) -> LockResult<Option<Arc<dyn Lease>>> {
        let holder = Uuid::now_v7();
        let record = LeaseRecord {
            holder,
            expires_at: Utc::now() + ttl,
        };
        let payload =
            serde_json::to_vec(&record).map_err(|e| LockError::Other(e.to_string()))?;

        let revision = match self.store.create(name, payload.clone().into()).await {
            Ok(revision) => revision,
            Err(e) if e.kind() == kv::CreateErrorKind::AlreadyExists => {
                // Held or left over from a dead holder; take over only past
                // expiry, guarded by the revision CAS.
                let Some(entry) = self
                    .store
                    .entry(name)
                    .await
                    .map_err(|e| LockError::Transient(e.to_string()))?
                else {
                    return Ok(None);
                };
                let current: LeaseRecord = match serde_json::from_slice(&entry.value) {
                    Ok(current) => current,
                    Err(_) => return Ok(None),
                };
                if current.expires_at > Utc::now() {
                    return Ok(None);
                }
                match self
                    .store
                    .update(name, payload.into(), entry.revision)
                    .await
                {
                    Ok(revision) => revision,
                    // Another contender won the takeover.
                    Err(_) => return Ok(None),
                }
            }
            Err(e) => return Err(LockError::Transient(e.to_string())),
        };

        debug!(lock = %name, %holder, revision, "lock acquired");
        Ok(Some(Arc::new(KvLease {
            store: self.store.clone(),
            name: name.to_string(),
            holder,
            ttl,
            revision: AtomicU64::new(revision),
        })))
    }
}

struct KvLease {
    store: kv::Store,
    name: String,
    holder: Uuid,
    ttl: Duration,
    revision: AtomicU64,
}

#[async_trait]
impl Lease for KvLease {
    async fn refresh(&self) -> LockResult<()> {
        let record = LeaseRecord {
            holder: self.holder,
            expires_at: Utc::now() + self.ttl,
        };
        let payload =
            serde_json::to_vec(&record).map_err(|e| LockError::Other(e.to_string()))?;
        match self
            .store
            .update(&self.name, payload.into(), self.revision.load(Ordering::Acquire))
            .await
        {
            Ok(revision) => {
                self.revision.store(revision, Ordering::Release);
                Ok(())
            }
            Err(_) => Err(LockError::Lost(self.name.clone())),
        }
    }

    async fn release(&self) -> LockResult<()> {
        // Revision-guarded delete: a successor's lock is left untouched.
        let _ = self
            .store
            .delete_expect_revision(&self.name, Some(self.revision.load(Ordering::Acquire)))
            .await;
        Ok(())
    }
}
