//! Sink contract: publish events to a partitioned bus
//!
//! A sinker is the destination side of a feeder. Delivery is at-least-once;
//! the sinker must publish serially per partition but may proceed
//! concurrently across partitions.

pub mod memory;

use async_trait::async_trait;
use thiserror::Error;

use crate::event::{Event, ResumeToken};
use crate::eventid::EventId;

/// Errors surfaced by sink operations
#[derive(Debug, Error)]
pub enum SinkError {
    /// Network-class failure; callers retry with backoff.
    #[error("transient sink error: {0}")]
    Transient(String),

    #[error("sink is closed")]
    Closed,

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("sink error: {0}")]
    Other(String),
}

impl SinkError {
    /// Whether the operation may be retried with backoff.
    pub fn is_transient(&self) -> bool {
        matches!(self, SinkError::Transient(_))
    }
}

/// Result type for sink operations
pub type SinkResult<T> = std::result::Result<T, SinkError>;

/// Highest acknowledged position of one partition.
#[derive(Debug, Clone, PartialEq)]
pub struct SinkPosition {
    /// ID of the last event acknowledged by the bus on the partition.
    pub id: EventId,
    /// Source cursor carried by that event, if it was fed from a change
    /// stream.
    pub resume_token: ResumeToken,
}

/// Destination capability bound to a partitioned topic.
#[async_trait]
pub trait Sinker: Send + Sync {
    /// Publish the event on its partition. Returns only once the bus has
    /// acknowledged the message; in-flight messages are not reflected by
    /// [`last_message`](Sinker::last_message).
    async fn sink(&self, event: &Event) -> SinkResult<()>;

    /// Highest acknowledged position of the partition, or `None` when
    /// nothing was ever published on it.
    async fn last_message(&self, partition: u32) -> SinkResult<Option<SinkPosition>>;

    /// Stop accepting events. Idempotent.
    async fn close(&self);
}

/// Safe resume position for a feeder covering partitions `low..=hi`: the
/// minimum last-acknowledged position across the range.
///
/// A partition with no recorded position forces a restart from the
/// beginning: redundant re-delivery is covered by at-least-once semantics,
/// a gap is not.
pub async fn resume_position(
    sinker: &dyn Sinker,
    low: u32,
    hi: u32,
) -> SinkResult<Option<SinkPosition>> {
    let mut min: Option<SinkPosition> = None;
    for partition in low..=hi {
        match sinker.last_message(partition).await? {
            Some(position) => {
                if min.as_ref().map_or(true, |m| position.id < m.id) {
                    min = Some(position);
                }
            }
            None => return Ok(None),
        }
    }
    Ok(min)
}
