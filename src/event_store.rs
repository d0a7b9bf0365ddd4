//! Write-side event store: the aggregate programming model
//!
//! Loads aggregates by folding snapshot + events, persists new events with
//! optimistic concurrency, and writes snapshots once enough events have
//! accumulated. Event payloads travel as tagged `(kind, JSON value)` pairs;
//! the optional [`Upcaster`] hook migrates old payloads on the way in.

use std::collections::BTreeMap;
use std::marker::PhantomData;
use std::sync::Arc;

use chrono::{DateTime, TimeZone, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::event::{EventDetail, EventRecord, ForgetRequest, Snapshot};
use crate::store::{EventRepository, StoreError, StoreResult};

/// An emitted-but-unsaved domain event.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingEvent {
    pub kind: String,
    pub body: serde_json::Value,
}

fn epoch() -> DateTime<Utc> {
    Utc.timestamp_millis_opt(0).unwrap()
}

/// Bookkeeping embedded by every aggregate type.
///
/// Only `id` (and the domain fields of the embedding struct) are part of the
/// snapshot body; version and timestamps live in the store rows.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Root {
    pub id: String,

    #[serde(skip)]
    pub version: u32,

    /// Events applied or emitted since the last snapshot; drives the
    /// snapshot threshold.
    #[serde(skip)]
    pub events_counter: u32,

    #[serde(skip)]
    pub pending: Vec<PendingEvent>,

    #[serde(skip_serializing, default = "epoch")]
    pub updated_at: DateTime<Utc>,
}

impl Default for Root {
    fn default() -> Self {
        Self {
            id: String::new(),
            version: 0,
            events_counter: 0,
            pending: Vec::new(),
            updated_at: epoch(),
        }
    }
}

impl Root {
    /// Record a new domain event: applied by the caller, saved later.
    pub fn emit(&mut self, kind: impl Into<String>, body: serde_json::Value) {
        self.pending.push(PendingEvent {
            kind: kind.into(),
            body,
        });
        self.events_counter += 1;
    }
}

/// A domain object whose state is the fold of its events.
pub trait Aggregate: Default + Serialize + DeserializeOwned + Send + Sync {
    /// Type name persisted on every event row, e.g. `"account"`.
    const AGGREGATE_TYPE: &'static str;

    fn root(&self) -> &Root;

    fn root_mut(&mut self) -> &mut Root;

    /// Fold one event into the state. Must be deterministic and must not
    /// emit new events.
    fn apply(&mut self, kind: &str, body: serde_json::Value);
}

/// Migrates event payloads written under an older schema.
pub trait Upcaster: Send + Sync {
    fn upcast(&self, kind: String, body: serde_json::Value) -> (String, serde_json::Value);
}

/// Per-save options.
#[derive(Debug, Clone, Default)]
pub struct SaveOptions {
    pub idempotency_key: String,
    pub labels: BTreeMap<String, String>,
}

impl SaveOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make this save safely retryable: a second save with the same key
    /// fails with [`StoreError::DuplicateIdempotencyKey`].
    pub fn with_idempotency_key(mut self, key: impl Into<String>) -> Self {
        self.idempotency_key = key.into();
        self
    }

    pub fn with_label(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(key.into(), value.into());
        self
    }
}

const DEFAULT_SNAPSHOT_THRESHOLD: u32 = 100;

/// Write-side store for one aggregate type.
pub struct EventStore<A: Aggregate> {
    repo: Arc<dyn EventRepository>,
    snapshot_threshold: u32,
    upcaster: Option<Arc<dyn Upcaster>>,
    _aggregate: PhantomData<fn() -> A>,
}

impl<A: Aggregate> EventStore<A> {
    pub fn new(repo: Arc<dyn EventRepository>) -> Self {
        Self {
            repo,
            snapshot_threshold: DEFAULT_SNAPSHOT_THRESHOLD,
            upcaster: None,
            _aggregate: PhantomData,
        }
    }

    /// Snapshot once this many events accumulated since the last one.
    pub fn with_snapshot_threshold(mut self, threshold: u32) -> Self {
        self.snapshot_threshold = threshold;
        self
    }

    pub fn with_upcaster(mut self, upcaster: Arc<dyn Upcaster>) -> Self {
        self.upcaster = Some(upcaster);
        self
    }

    /// Rehydrate an aggregate from its latest snapshot plus newer events.
    pub async fn get_by_id(&self, aggregate_id: &str) -> StoreResult<A> {
        let snapshot = self.repo.get_snapshot(aggregate_id).await?;
        let (mut aggregate, snapshot_version) = match &snapshot {
            Some(snap) => {
                let mut aggregate: A = serde_json::from_slice(&snap.body)?;
                aggregate.root_mut().version = snap.aggregate_version;
                aggregate.root_mut().updated_at = snap.created_at;
                (aggregate, Some(snap.aggregate_version))
            }
            None => {
                let mut aggregate = A::default();
                aggregate.root_mut().id = aggregate_id.to_string();
                (aggregate, None)
            }
        };

        let events = self
            .repo
            .get_aggregate_events(aggregate_id, snapshot_version)
            .await?;
        if snapshot.is_none() && events.is_empty() {
            return Err(StoreError::UnknownAggregate(aggregate_id.to_string()));
        }

        for event in events {
            let body: serde_json::Value = serde_json::from_slice(&event.body)?;
            let (kind, body) = match &self.upcaster {
                Some(upcaster) => upcaster.upcast(event.kind, body),
                None => (event.kind, body),
            };
            aggregate.apply(&kind, body);
            let root = aggregate.root_mut();
            root.version = event.aggregate_version;
            root.events_counter += 1;
            root.updated_at = event.created_at;
        }
        Ok(aggregate)
    }

    /// Load, mutate through `action`, save. Fails with
    /// [`StoreError::UnknownAggregate`] when nothing exists under the ID.
    pub async fn exec<F>(
        &self,
        aggregate_id: &str,
        options: SaveOptions,
        action: F,
    ) -> StoreResult<A>
    where
        F: FnOnce(&mut A) -> StoreResult<()> + Send,
    {
        let mut aggregate = self.get_by_id(aggregate_id).await?;
        action(&mut aggregate)?;
        self.save(&mut aggregate, options).await?;
        Ok(aggregate)
    }

    /// Persist the aggregate's pending events atomically.
    ///
    /// A no-op when nothing is pending. Writes a snapshot when the events
    /// since the last one reach the threshold; snapshot failures are logged
    /// and swallowed.
    pub async fn save(&self, aggregate: &mut A, options: SaveOptions) -> StoreResult<()> {
        if aggregate.root().pending.is_empty() {
            return Ok(());
        }

        // Millisecond precision is all the event ID can carry. Clock skew
        // could put `now` at or before the aggregate's last update, which
        // would break per-aggregate ID ordering; bump past it.
        let mut now = Utc
            .timestamp_millis_opt(Utc::now().timestamp_millis())
            .unwrap();
        if now <= aggregate.root().updated_at {
            now = aggregate.root().updated_at + chrono::Duration::milliseconds(1);
        }

        let mut details = Vec::with_capacity(aggregate.root().pending.len());
        for pending in &aggregate.root().pending {
            details.push(EventDetail {
                kind: pending.kind.clone(),
                body: serde_json::to_vec(&pending.body)?,
            });
        }

        let record = EventRecord {
            aggregate_id: aggregate.root().id.clone(),
            version: aggregate.root().version,
            aggregate_type: A::AGGREGATE_TYPE.to_string(),
            idempotency_key: options.idempotency_key,
            labels: options.labels,
            created_at: now,
            details,
        };
        let (last_id, last_version) = self.repo.save_event(&record).await?;

        {
            let root = aggregate.root_mut();
            root.version = last_version;
            root.updated_at = now;
            root.pending.clear();
        }

        if aggregate.root().events_counter >= self.snapshot_threshold {
            let snapshot = Snapshot {
                id: last_id,
                aggregate_id: aggregate.root().id.clone(),
                aggregate_version: last_version,
                aggregate_type: A::AGGREGATE_TYPE.to_string(),
                body: serde_json::to_vec(aggregate)?,
                created_at: Utc::now(),
            };
            match self.repo.save_snapshot(&snapshot).await {
                Ok(()) => aggregate.root_mut().events_counter = 0,
                Err(e) => {
                    warn!(
                        aggregate_id = %aggregate.root().id,
                        error = %e,
                        "snapshot write failed, continuing without"
                    );
                }
            }
        }
        Ok(())
    }

    pub async fn has_idempotency_key(&self, key: &str) -> StoreResult<bool> {
        if key.is_empty() {
            return Ok(false);
        }
        self.repo.has_idempotency_key(A::AGGREGATE_TYPE, key).await
    }

    /// Erase values from already-written events and snapshots.
    ///
    /// `scrub_event` receives each matching event's decoded payload;
    /// `scrub_snapshot` receives each snapshot's decoded aggregate state.
    /// They are separate on purpose: snapshot bodies are not event bodies.
    pub async fn forget<E, S>(
        &self,
        request: &ForgetRequest,
        scrub_event: E,
        scrub_snapshot: S,
    ) -> StoreResult<()>
    where
        E: Fn(&str, serde_json::Value) -> serde_json::Value + Send + Sync,
        S: Fn(serde_json::Value) -> serde_json::Value + Send + Sync,
    {
        let rewrite_event = move |kind: &str, body: &[u8]| -> StoreResult<Vec<u8>> {
            let value: serde_json::Value = serde_json::from_slice(body)?;
            Ok(serde_json::to_vec(&scrub_event(kind, value))?)
        };
        let rewrite_snapshot = move |body: &[u8]| -> StoreResult<Vec<u8>> {
            let value: serde_json::Value = serde_json::from_slice(body)?;
            Ok(serde_json::to_vec(&scrub_snapshot(value))?)
        };
        self.repo
            .forget(request, &rewrite_event, &rewrite_snapshot)
            .await
    }
}
