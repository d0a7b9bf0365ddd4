//! Projection contracts and lifecycle
//!
//! A projection is a read-side view materialised by handling events. The
//! runtime drives it through the capability set below: replay from the store
//! ([`player`]), live consumption from the bus ([`EventBus`]), and the
//! freeze/rebuild protocol ([`boot`]).

pub mod boot;
pub mod player;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::event::{Event, ResumeToken};
use crate::eventid::EventId;
use crate::sink::SinkError;
use crate::store::StoreError;

/// Errors surfaced while driving a projection
#[derive(Debug, Error)]
pub enum ProjectionError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Bus(#[from] BusError),

    /// Handler failures are fatal: idempotent re-handling is the handler's
    /// contract, so an error here means the projection cannot make progress.
    #[error("projection handler error: {0}")]
    Handler(String),

    #[error(transparent)]
    Lock(#[from] crate::worker::lock::LockError),

    #[error("rebuild of '{0}' already in progress")]
    RebuildInProgress(String),
}

/// Result type for projection operations
pub type ProjectionResult<T> = std::result::Result<T, ProjectionError>;

/// Errors surfaced by the bus consumer side
#[derive(Debug, Error)]
pub enum BusError {
    #[error("transient bus error: {0}")]
    Transient(String),

    #[error("bus is closed")]
    Closed,

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("bus error: {0}")]
    Other(String),
}

/// Result type for bus operations
pub type BusResult<T> = std::result::Result<T, BusError>;

impl From<SinkError> for BusError {
    fn from(err: SinkError) -> Self {
        match err {
            SinkError::Transient(msg) => BusError::Transient(msg),
            SinkError::Closed => BusError::Closed,
            SinkError::Serialization(e) => BusError::Serialization(e),
            SinkError::Other(msg) => BusError::Other(msg),
        }
    }
}

/// The capability set a read-side view exposes to the runtime.
#[async_trait]
pub trait Projection: Send + Sync {
    /// Unique projection name; also keys freeze/unfreeze notifications.
    fn name(&self) -> &str;

    /// Aggregate types this projection consumes.
    fn aggregate_types(&self) -> Vec<String>;

    /// Position to resume from, persisted by the projection itself.
    /// [`EventId::zero`] replays from the beginning.
    async fn resume_event_id(&self) -> ProjectionResult<EventId>;

    /// Apply one event. Must be idempotent: at-least-once delivery and the
    /// boot protocol may hand the same event over more than once.
    async fn handle(&self, event: &Event) -> ProjectionResult<()>;
}

/// A projection lifecycle that can be remotely paused and resumed.
#[async_trait]
pub trait Freezer: Send + Sync {
    fn name(&self) -> &str;

    /// Stop consuming and block [`Wait`]ers. Returns whether this instance
    /// actually held the projection (to inform rebuild coordination).
    async fn freeze(&self) -> bool;

    /// Release blocked waiters; the next boot restarts from the persisted
    /// resume position.
    async fn unfreeze(&self);
}

/// Freeze/unfreeze command broadcast on the control topic.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Notification {
    pub projection: String,
    pub action: Action,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Action {
    Freeze,
    Unfreeze,
}

/// Consumer-side bus capability for projections.
#[async_trait]
pub trait EventBus: Send + Sync {
    /// Cursor of the partition as of now; a consumer started from it sees
    /// exactly the messages published afterwards.
    async fn resume_token(&self, partition: u32) -> BusResult<ResumeToken>;

    /// Start a consumer of one partition from `resume`, handing every event
    /// to the projection. The returned task finishes when the consumer
    /// stops, on cancellation or on a fatal handler error.
    async fn start_consumer(
        &self,
        shutdown: CancellationToken,
        partition: u32,
        resume: ResumeToken,
        projection: std::sync::Arc<dyn Projection>,
    ) -> BusResult<JoinHandle<()>>;

    /// Listen for [`Notification`]s addressed to the freezer's projection
    /// until cancelled.
    async fn start_notifier(
        &self,
        shutdown: CancellationToken,
        freezer: std::sync::Arc<dyn Freezer>,
    ) -> BusResult<()>;

    /// Broadcast a freeze command for the named projection.
    async fn freeze_projection(&self, name: &str) -> BusResult<()>;

    /// Broadcast an unfreeze command for the named projection.
    async fn unfreeze_projection(&self, name: &str) -> BusResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_notification_wire_form() {
        let n = Notification {
            projection: "balance".to_string(),
            action: Action::Freeze,
        };
        let json = serde_json::to_string(&n).unwrap();
        assert_eq!(json, r#"{"projection":"balance","action":"freeze"}"#);

        let back: Notification = serde_json::from_str(&json).unwrap();
        assert_eq!(back, n);
    }
}
