//! NATS KV-backed member list
//!
//! Every process keeps one key in a shared bucket: its identity mapping to
//! the worker names it claims. The bucket's max-age acts as the liveness
//! TTL, so a process that stops heartbeating disappears from the list.

use std::time::Duration;

use async_nats::jetstream::{self, kv};
use async_trait::async_trait;
use futures::StreamExt;
use uuid::Uuid;

use eventline::worker::membership::{MemberError, MemberList, MemberResult, MemberWorkers};

use crate::error::{NatsError, NatsResult};

/// Configuration of the membership bucket.
#[derive(Debug, Clone)]
pub struct KvMemberConfig {
    /// Bucket name; one bucket per member-list namespace.
    pub bucket: String,

    /// Staleness bound: entries older than this are treated as departed.
    pub ttl: Duration,
}

impl Default for KvMemberConfig {
    fn default() -> Self {
        Self {
            bucket: "eventline-members".to_string(),
            ttl: Duration::from_secs(15),
        }
    }
}

/// KV-backed membership handle of one process.
pub struct KvMemberList {
    store: kv::Store,
    name: String,
}

impl KvMemberList {
    pub async fn new(client: async_nats::Client, config: KvMemberConfig) -> NatsResult<Self> {
        let jetstream = jetstream::new(client);
        let store = jetstream
            .create_key_value(kv::Config {
                bucket: config.bucket,
                max_age: config.ttl,
                history: 1,
                ..Default::default()
            })
            .await
            .map_err(|e| NatsError::KvStore(e.to_string()))?;
        Ok(Self {
            store,
            name: format!("member-{}", Uuid::now_v7().simple()),
        })
    }
}

#[async_trait]
impl MemberList for KvMemberList {
    fn name(&self) -> &str {
        &self.name
    }

    async fn list(&self) -> MemberResult<Vec<MemberWorkers>> {
        let mut keys = self
            .store
            .keys()
            .await
            .map_err(|e| MemberError::Transient(e.to_string()))?;

        let mut members = Vec::new();
        while let Some(key) = keys.next().await {
            let key = key.map_err(|e| MemberError::Transient(e.to_string()))?;
            let Some(value) = self
                .store
                .get(&key)
                .await
                .map_err(|e| MemberError::Transient(e.to_string()))?
            else {
                // Expired between the key listing and the read.
                continue;
            };
            let workers: Vec<String> = serde_json::from_slice(&value)?;
            members.push(MemberWorkers { name: key, workers });
        }
        members.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(members)
    }

    async fn register(&self, workers: &[String]) -> MemberResult<()> {
        let payload = serde_json::to_vec(workers)?;
        self.store
            .put(&self.name, payload.into())
            .await
            .map_err(|e| MemberError::Transient(e.to_string()))?;
        Ok(())
    }
}
