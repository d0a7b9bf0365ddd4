//! History replay
//!
//! Feeds a projection from the store's global event sequence in batches
//! until exhausted. Used by the boot protocol for both the long initial
//! replay and the short tail replay around the switch to the live consumer.

use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use super::{Projection, ProjectionResult};
use crate::event::Filter;
use crate::eventid::EventId;
use crate::store::EventReader;

const DEFAULT_BATCH_SIZE: usize = 100;

pub struct Player {
    reader: Arc<dyn EventReader>,
    batch_size: usize,
}

impl Player {
    pub fn new(reader: Arc<dyn EventReader>) -> Self {
        Self {
            reader,
            batch_size: DEFAULT_BATCH_SIZE,
        }
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    /// Hand every stored event after `after` to the projection, in ID order,
    /// until the store is exhausted. Returns the last replayed ID, or
    /// `after` when nothing matched.
    pub async fn replay(
        &self,
        projection: &dyn Projection,
        after: EventId,
        filter: &Filter,
    ) -> ProjectionResult<EventId> {
        let mut cursor = after;
        let mut total = 0usize;
        loop {
            let events = self
                .reader
                .get_events(cursor, self.batch_size, Duration::ZERO, filter)
                .await?;
            let batch = events.len();
            for event in events {
                projection.handle(&event).await?;
                cursor = event.id;
                total += 1;
            }
            if batch < self.batch_size {
                debug!(projection = %projection.name(), replayed = total, cursor = %cursor, "replay done");
                return Ok(cursor);
            }
        }
    }
}
