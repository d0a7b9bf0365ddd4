//! Test fixtures for eventline integration tests
//!
//! A small banking domain (account aggregate, recording projection) plus
//! helpers to seed stores, shared by the end-to-end suites. Each suite uses
//! a subset.
#![allow(dead_code)]

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::Mutex;

use eventline::event::{Event, EventDetail, EventRecord};
use eventline::event_store::{Aggregate, Root};
use eventline::eventid::EventId;
use eventline::projection::{Projection, ProjectionResult};
use eventline::store::memory::MemoryStore;
use eventline::store::EventRepository;

/// A bank account: the write-side aggregate of the test domain.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Account {
    #[serde(flatten)]
    pub root: Root,
    pub balance: i64,
    pub owner: String,
}

impl Account {
    pub fn create(id: &str, owner: &str, balance: i64) -> Self {
        let mut account = Account::default();
        account.root.id = id.to_string();
        let body = json!({"owner": owner, "balance": balance});
        account.apply("AccountCreated", body.clone());
        account.root.emit("AccountCreated", body);
        account
    }

    pub fn deposit(&mut self, amount: i64) {
        let body = json!({"amount": amount});
        self.apply("MoneyDeposited", body.clone());
        self.root.emit("MoneyDeposited", body);
    }
}

impl Aggregate for Account {
    const AGGREGATE_TYPE: &'static str = "account";

    fn root(&self) -> &Root {
        &self.root
    }

    fn root_mut(&mut self) -> &mut Root {
        &mut self.root
    }

    fn apply(&mut self, kind: &str, body: serde_json::Value) {
        match kind {
            "AccountCreated" => {
                self.owner = body["owner"].as_str().unwrap_or_default().to_string();
                self.balance = body["balance"].as_i64().unwrap_or_default();
            }
            "MoneyDeposited" => {
                self.balance += body["amount"].as_i64().unwrap_or_default();
            }
            _ => {}
        }
    }
}

/// A projection that records every handled event, deduplicating by ID so
/// at-least-once redelivery does not skew counts.
pub struct RecordingProjection {
    name: String,
    pub handled: Mutex<Vec<Event>>,
}

impl RecordingProjection {
    pub fn new(name: &str) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            handled: Mutex::new(Vec::new()),
        })
    }

    pub async fn handled_ids(&self) -> Vec<EventId> {
        self.handled.lock().await.iter().map(|e| e.id).collect()
    }

    pub async fn len(&self) -> usize {
        self.handled.lock().await.len()
    }
}

#[async_trait]
impl Projection for RecordingProjection {
    fn name(&self) -> &str {
        &self.name
    }

    fn aggregate_types(&self) -> Vec<String> {
        vec!["account".to_string()]
    }

    async fn resume_event_id(&self) -> ProjectionResult<EventId> {
        Ok(self
            .handled
            .lock()
            .await
            .iter()
            .map(|e| e.id)
            .max()
            .unwrap_or_else(EventId::zero))
    }

    async fn handle(&self, event: &Event) -> ProjectionResult<()> {
        let mut handled = self.handled.lock().await;
        if !handled.iter().any(|e| e.id == event.id) {
            handled.push(event.clone());
        }
        Ok(())
    }
}

/// Append raw events to the store with an explicit commit timestamp.
pub async fn seed_at(
    store: &MemoryStore,
    aggregate_id: &str,
    version: u32,
    kinds: &[&str],
    created_at: DateTime<Utc>,
) -> EventId {
    let (id, _) = store
        .save_event(&EventRecord {
            aggregate_id: aggregate_id.to_string(),
            version,
            aggregate_type: "account".to_string(),
            idempotency_key: String::new(),
            labels: BTreeMap::new(),
            created_at,
            details: kinds
                .iter()
                .map(|k| EventDetail {
                    kind: k.to_string(),
                    body: b"{}".to_vec(),
                })
                .collect(),
        })
        .await
        .unwrap();
    id
}

/// Append raw events old enough to be outside any trailing-lag window.
pub async fn seed(
    store: &MemoryStore,
    aggregate_id: &str,
    version: u32,
    kinds: &[&str],
) -> EventId {
    seed_at(
        store,
        aggregate_id,
        version,
        kinds,
        Utc::now() - Duration::from_secs(2),
    )
    .await
}
