//! In-memory event store
//!
//! Contract-conformant store used by the in-process wiring and the test
//! suites. Honors trailing-lag visibility against the wall clock and emits a
//! change notification per insert, which backs the push feeder via
//! [`ChangeSource`].

use std::collections::{BTreeMap, HashMap, HashSet};
use std::ops::Bound;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use futures::StreamExt;
use tokio::sync::{broadcast, RwLock};
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;

use super::{
    ChangeSource, ChangeStream, EventReader, EventRepository, EventRewrite, SnapshotRewrite,
    StoreError, StoreResult,
};
use crate::event::{Event, EventRecord, Filter, ForgetRequest, ResumeToken, Snapshot};
use crate::eventid::EventId;
use crate::partition;

const CHANGE_CHANNEL_CAPACITY: usize = 1024;

#[derive(Default)]
struct State {
    events: BTreeMap<EventId, Event>,
    versions: HashMap<String, u32>,
    snapshots: HashMap<String, Vec<Snapshot>>,
    idempotency: HashSet<(String, String)>,
}

/// Shared in-memory store.
///
/// `Clone` is cheap; all clones observe the same state.
#[derive(Clone)]
pub struct MemoryStore {
    state: Arc<RwLock<State>>,
    changes: broadcast::Sender<Event>,
}

impl MemoryStore {
    pub fn new() -> Self {
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Self {
            state: Arc::new(RwLock::new(State::default())),
            changes,
        }
    }

    /// Number of stored events, visibility rules ignored.
    pub async fn len(&self) -> usize {
        self.state.read().await.events.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.state.read().await.events.is_empty()
    }

    fn encode_token(id: EventId) -> ResumeToken {
        u128::from(id).to_be_bytes().to_vec()
    }

    fn decode_token(token: &[u8]) -> StoreResult<EventId> {
        let bytes: [u8; 16] = token
            .try_into()
            .map_err(|_| StoreError::Other(format!("invalid resume token of {} bytes", token.len())))?;
        Ok(EventId::from(u128::from_be_bytes(bytes)))
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EventReader for MemoryStore {
    async fn get_last_event_id(
        &self,
        trailing_lag: std::time::Duration,
        filter: &Filter,
    ) -> StoreResult<Option<EventId>> {
        let horizon = Utc::now() - trailing_lag;
        let state = self.state.read().await;
        Ok(state
            .events
            .values()
            .rev()
            .find(|e| e.created_at <= horizon && filter.matches(e))
            .map(|e| e.id))
    }

    async fn get_events(
        &self,
        after: EventId,
        batch_size: usize,
        trailing_lag: std::time::Duration,
        filter: &Filter,
    ) -> StoreResult<Vec<Event>> {
        let horizon = Utc::now() - trailing_lag;
        let state = self.state.read().await;
        let events = state
            .events
            .range((Bound::Excluded(after), Bound::Unbounded))
            .map(|(_, e)| e)
            .filter(|e| e.created_at <= horizon && filter.matches(e))
            .take(if batch_size == 0 { usize::MAX } else { batch_size })
            .cloned()
            .collect();
        Ok(events)
    }
}

#[async_trait]
impl EventRepository for MemoryStore {
    async fn save_event(&self, record: &EventRecord) -> StoreResult<(EventId, u32)> {
        let mut state = self.state.write().await;

        let current = state
            .versions
            .get(&record.aggregate_id)
            .copied()
            .unwrap_or(0);
        if record.version != current {
            return Err(StoreError::ConcurrentModification(
                record.aggregate_id.clone(),
            ));
        }

        let idempotency = (record.aggregate_type.clone(), record.idempotency_key.clone());
        if !record.idempotency_key.is_empty() && state.idempotency.contains(&idempotency) {
            return Err(StoreError::DuplicateIdempotencyKey(
                record.idempotency_key.clone(),
            ));
        }

        let hash = partition::hash(&record.aggregate_id);
        let mut version = record.version;
        let mut last_id = EventId::zero();
        let mut inserted = Vec::with_capacity(record.details.len());
        for detail in &record.details {
            version += 1;
            let id = EventId::new(record.created_at, &record.aggregate_id, version);
            let event = Event {
                id,
                aggregate_id: record.aggregate_id.clone(),
                aggregate_id_hash: hash,
                aggregate_version: version,
                aggregate_type: record.aggregate_type.clone(),
                kind: detail.kind.clone(),
                body: detail.body.clone(),
                idempotency_key: record.idempotency_key.clone(),
                labels: record.labels.clone(),
                created_at: record.created_at,
                resume_token: Vec::new(),
            };
            state.events.insert(id, event.clone());
            inserted.push(event);
            last_id = id;
        }

        state.versions.insert(record.aggregate_id.clone(), version);
        if !record.idempotency_key.is_empty() {
            state.idempotency.insert(idempotency);
        }
        drop(state);

        // Notify change-stream watchers after the write is visible. A send
        // error only means nobody is watching.
        for event in inserted {
            let _ = self.changes.send(event);
        }

        Ok((last_id, version))
    }

    async fn get_snapshot(&self, aggregate_id: &str) -> StoreResult<Option<Snapshot>> {
        let state = self.state.read().await;
        Ok(state
            .snapshots
            .get(aggregate_id)
            .and_then(|snaps| snaps.last().cloned()))
    }

    async fn save_snapshot(&self, snapshot: &Snapshot) -> StoreResult<()> {
        let mut state = self.state.write().await;
        state
            .snapshots
            .entry(snapshot.aggregate_id.clone())
            .or_default()
            .push(snapshot.clone());
        Ok(())
    }

    async fn get_aggregate_events(
        &self,
        aggregate_id: &str,
        after_version: Option<u32>,
    ) -> StoreResult<Vec<Event>> {
        let state = self.state.read().await;
        let mut events: Vec<Event> = state
            .events
            .values()
            .filter(|e| {
                e.aggregate_id == aggregate_id
                    && after_version.map_or(true, |v| e.aggregate_version > v)
            })
            .cloned()
            .collect();
        events.sort_by_key(|e| e.aggregate_version);
        Ok(events)
    }

    async fn has_idempotency_key(&self, aggregate_type: &str, key: &str) -> StoreResult<bool> {
        if key.is_empty() {
            return Ok(false);
        }
        let state = self.state.read().await;
        Ok(state
            .idempotency
            .contains(&(aggregate_type.to_string(), key.to_string())))
    }

    async fn forget(
        &self,
        request: &ForgetRequest,
        rewrite_event: EventRewrite<'_>,
        rewrite_snapshot: SnapshotRewrite<'_>,
    ) -> StoreResult<()> {
        let mut state = self.state.write().await;

        let ids: Vec<EventId> = state
            .events
            .values()
            .filter(|e| e.aggregate_id == request.aggregate_id && e.kind == request.event_kind)
            .map(|e| e.id)
            .collect();
        for id in ids {
            let event = state.events.get_mut(&id).expect("event id just listed");
            event.body = rewrite_event(&event.kind, &event.body)?;
        }

        if let Some(snaps) = state.snapshots.get_mut(&request.aggregate_id) {
            for snap in snaps {
                snap.body = rewrite_snapshot(&snap.body)?;
            }
        }
        Ok(())
    }
}

#[async_trait]
impl ChangeSource for MemoryStore {
    async fn watch(
        &self,
        resume: Option<ResumeToken>,
        filter: &Filter,
    ) -> StoreResult<ChangeStream> {
        let after = match resume.as_deref() {
            Some(token) if !token.is_empty() => Self::decode_token(token)?,
            _ => EventId::zero(),
        };

        // Subscribing before snapshotting the backlog guarantees no insert is
        // missed across the switch to live notifications; the seen-set drops
        // the overlap.
        let rx = self.changes.subscribe();
        let state = self.state.read().await;
        let backlog: Vec<Event> = state
            .events
            .range((Bound::Excluded(after), Bound::Unbounded))
            .map(|(_, e)| e)
            .filter(|e| filter.matches(e))
            .cloned()
            .map(|mut e| {
                e.resume_token = Self::encode_token(e.id);
                e
            })
            .collect();
        drop(state);

        let seen: HashSet<EventId> = backlog.iter().map(|e| e.id).collect();
        let filter = filter.clone();
        let live = BroadcastStream::new(rx).filter_map(move |item| {
            let out = match item {
                Ok(mut event) => {
                    if event.id <= after || seen.contains(&event.id) || !filter.matches(&event) {
                        None
                    } else {
                        event.resume_token = Self::encode_token(event.id);
                        Some(Ok(event))
                    }
                }
                Err(BroadcastStreamRecvError::Lagged(n)) => Some(Err(StoreError::Transient(
                    format!("change stream lagged by {n} events"),
                ))),
            };
            futures::future::ready(out)
        });

        Ok(futures::stream::iter(backlog.into_iter().map(Ok))
            .chain(live)
            .boxed())
    }
}
