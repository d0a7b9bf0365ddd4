//! Event store contract
//!
//! The core never talks to a concrete database; it consumes these capability
//! traits. Drivers implement them against their engine of choice. The
//! in-memory implementation in [`memory`] doubles as the test substrate and
//! the in-process wiring.

pub mod memory;

use std::time::Duration;

use async_trait::async_trait;
use futures::stream::BoxStream;
use thiserror::Error;

use crate::event::{Event, EventRecord, Filter, ForgetRequest, ResumeToken, Snapshot};
use crate::eventid::{EventId, EventIdError};

/// Errors surfaced by store operations
#[derive(Debug, Error)]
pub enum StoreError {
    /// Another writer saved the aggregate at the same version. Surfaced to
    /// the caller of save, never retried internally.
    #[error("concurrent modification of aggregate '{0}'")]
    ConcurrentModification(String),

    /// A save with this `(aggregate type, idempotency key)` pair already
    /// happened. Reactors treat this as success-no-op.
    #[error("duplicate idempotency key '{0}'")]
    DuplicateIdempotencyKey(String),

    /// No snapshot and no events exist for the aggregate.
    #[error("aggregate '{0}' was not found")]
    UnknownAggregate(String),

    /// Network-class failure; callers retry with backoff.
    #[error("transient store error: {0}")]
    Transient(String),

    #[error(transparent)]
    InvalidId(#[from] EventIdError),

    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),

    #[error("store error: {0}")]
    Other(String),
}

impl StoreError {
    /// Whether the operation may be retried with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Transient(_))
    }
}

/// Result type for store operations
pub type StoreResult<T> = std::result::Result<T, StoreError>;

/// Rewrites an event body during Forget; receives the event kind.
pub type EventRewrite<'a> = &'a (dyn Fn(&str, &[u8]) -> StoreResult<Vec<u8>> + Send + Sync);

/// Rewrites a snapshot body during Forget. Deliberately a separate function
/// from [`EventRewrite`]: snapshot bodies hold whole-aggregate state, not a
/// single event payload.
pub type SnapshotRewrite<'a> = &'a (dyn Fn(&[u8]) -> StoreResult<Vec<u8>> + Send + Sync);

/// Read-only scan capability over the global, ID-ordered event sequence.
///
/// This is the only store capability feeders and projection replay need.
#[async_trait]
pub trait EventReader: Send + Sync {
    /// Highest event ID visible under `trailing_lag` and `filter`, or `None`
    /// when no event matches.
    async fn get_last_event_id(
        &self,
        trailing_lag: Duration,
        filter: &Filter,
    ) -> StoreResult<Option<EventId>>;

    /// Events with ID strictly greater than `after`, ordered by ID ascending.
    ///
    /// `after == EventId::zero()` scans from the beginning. Events younger
    /// than `trailing_lag` are withheld until fully visible. `batch_size == 0`
    /// means unbounded.
    async fn get_events(
        &self,
        after: EventId,
        batch_size: usize,
        trailing_lag: Duration,
        filter: &Filter,
    ) -> StoreResult<Vec<Event>>;
}

/// Full persistence contract of an event store driver.
#[async_trait]
pub trait EventRepository: EventReader {
    /// Atomically append the record's details as consecutive events,
    /// returning the last event ID and the final aggregate version.
    ///
    /// Fails with [`StoreError::ConcurrentModification`] on an
    /// `(aggregate_id, version)` clash and with
    /// [`StoreError::DuplicateIdempotencyKey`] when the record carries a key
    /// already used for its aggregate type.
    async fn save_event(&self, record: &EventRecord) -> StoreResult<(EventId, u32)>;

    /// Latest snapshot of the aggregate, if any.
    async fn get_snapshot(&self, aggregate_id: &str) -> StoreResult<Option<Snapshot>>;

    /// Persist a snapshot. Callers treat failures as non-fatal.
    async fn save_snapshot(&self, snapshot: &Snapshot) -> StoreResult<()>;

    /// Events of one aggregate ordered by version ascending, optionally only
    /// those after `after_version`.
    async fn get_aggregate_events(
        &self,
        aggregate_id: &str,
        after_version: Option<u32>,
    ) -> StoreResult<Vec<Event>>;

    /// Whether a save with this `(aggregate type, idempotency key)` pair
    /// already happened.
    async fn has_idempotency_key(&self, aggregate_type: &str, key: &str) -> StoreResult<bool>;

    /// Rewrite the bodies of the matching events and of every snapshot of the
    /// aggregate, in place. The only mutation permitted after write.
    async fn forget(
        &self,
        request: &ForgetRequest,
        rewrite_event: EventRewrite<'_>,
        rewrite_snapshot: SnapshotRewrite<'_>,
    ) -> StoreResult<()>;
}

/// Ordered stream of inserted events with resume cursors attached.
pub type ChangeStream = BoxStream<'static, StoreResult<Event>>;

/// Store-native change stream capability consumed by the push feeder.
///
/// The stream preserves insert order for a single aggregate's events; events
/// of different aggregates may interleave out of ID order.
#[async_trait]
pub trait ChangeSource: Send + Sync {
    /// Open the change stream after the position encoded in `resume`, or from
    /// the oldest available insert when `resume` is `None`. Each yielded
    /// event carries the cursor to resume from after it.
    async fn watch(&self, resume: Option<ResumeToken>, filter: &Filter)
        -> StoreResult<ChangeStream>;
}
