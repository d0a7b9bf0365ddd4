//! Trailing-lag polling feeder
//!
//! Scans the store by event ID, staying `trailing_lag` behind the wall clock:
//! a concurrent writer may commit a lower-ID event after a higher-ID one
//! becomes visible, so events are only read once old enough to be fully
//! settled. Progress restarts from the sinker's last acknowledged position.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{Backoff, FeedResult, Feeder};
use crate::event::{Event, Filter};
use crate::eventid::EventId;
use crate::partition::{PartitionSlot, ALL_PARTITION};
use crate::sink::{resume_position, Sinker};
use crate::store::EventReader;

/// Tuning knobs of a [`PollFeeder`].
#[derive(Debug, Clone)]
pub struct PollConfig {
    /// Maximum events fetched per scan.
    pub batch_size: usize,

    /// Sleep between scans once the store is drained.
    pub poll_interval: Duration,

    /// Safety window subtracted from `now` when scanning.
    pub trailing_lag: Duration,

    /// Partition count of the scheme; 0 disables partitioning.
    pub partitions: u32,

    /// Partition range owned by this feeder.
    pub slot: PartitionSlot,

    /// Only these aggregate types; empty means all.
    pub aggregate_types: Vec<String>,

    /// Label constraints forwarded to the store filter.
    pub labels: BTreeMap<String, Vec<String>>,
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            poll_interval: Duration::from_millis(500),
            trailing_lag: Duration::from_millis(250),
            partitions: 0,
            slot: PartitionSlot::all(),
            aggregate_types: Vec::new(),
            labels: BTreeMap::new(),
        }
    }
}

impl PollConfig {
    fn filter(&self) -> Filter {
        let mut filter = Filter::new()
            .with_aggregate_types(self.aggregate_types.clone())
            .with_partitions(self.partitions, self.slot.from, self.slot.to);
        filter.labels = self.labels.clone();
        filter
    }
}

/// Polling feeder over an [`EventReader`].
pub struct PollFeeder {
    reader: Arc<dyn EventReader>,
    config: PollConfig,
}

impl PollFeeder {
    pub fn new(reader: Arc<dyn EventReader>, config: PollConfig) -> Self {
        Self { reader, config }
    }

    /// Last position acknowledged across the owned partition range, retried
    /// until available or cancelled.
    async fn starting_position(
        &self,
        shutdown: &CancellationToken,
        sinker: &dyn Sinker,
        backoff: &mut Backoff,
    ) -> FeedResult<Option<EventId>> {
        let (low, hi) = if self.config.partitions == 0 {
            (ALL_PARTITION, ALL_PARTITION)
        } else {
            (self.config.slot.from, self.config.slot.to)
        };
        loop {
            match resume_position(sinker, low, hi).await {
                Ok(position) => return Ok(position.map(|p| p.id)),
                Err(e) if e.is_transient() => {
                    warn!(error = %e, "could not read sink position, backing off");
                    if !backoff.wait(shutdown).await {
                        return Ok(None);
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
    }

    /// Publish one event, retrying transient sink failures without advancing
    /// the cursor. Returns `false` when cancelled mid-retry.
    async fn sink_event(
        &self,
        shutdown: &CancellationToken,
        sinker: &dyn Sinker,
        backoff: &mut Backoff,
        event: &Event,
    ) -> FeedResult<bool> {
        loop {
            match sinker.sink(event).await {
                Ok(()) => {
                    backoff.reset();
                    return Ok(true);
                }
                Err(e) if e.is_transient() => {
                    warn!(event_id = %event.id, error = %e, "sink failed, retrying");
                    if !backoff.wait(shutdown).await {
                        return Ok(false);
                    }
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

#[async_trait]
impl Feeder for PollFeeder {
    async fn feed(&self, shutdown: CancellationToken, sinker: Arc<dyn Sinker>) -> FeedResult<()> {
        let filter = self.config.filter();
        let mut backoff = Backoff::new(
            self.config.poll_interval / 10,
            self.config.poll_interval,
        );

        let mut last_id = self
            .starting_position(&shutdown, sinker.as_ref(), &mut backoff)
            .await?
            .unwrap_or_else(EventId::zero);
        if shutdown.is_cancelled() {
            return Ok(());
        }
        info!(slot = %self.config.slot.label(), from = %last_id, "poll feeder starting");

        loop {
            let events = match self
                .reader
                .get_events(
                    last_id,
                    self.config.batch_size,
                    self.config.trailing_lag,
                    &filter,
                )
                .await
            {
                Ok(events) => {
                    backoff.reset();
                    events
                }
                Err(e) if e.is_transient() => {
                    warn!(error = %e, "store scan failed, backing off");
                    if !backoff.wait(&shutdown).await {
                        return Ok(());
                    }
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            let drained = events.len() < self.config.batch_size;
            for event in &events {
                if shutdown.is_cancelled() {
                    return Ok(());
                }
                // The store filter already restricted the scan; this guards
                // against a driver returning rows outside the owned range.
                let in_range = self.config.partitions == 0
                    || self.config.slot.contains(event.partition(self.config.partitions));
                if in_range
                    && !self
                        .sink_event(&shutdown, sinker.as_ref(), &mut backoff, event)
                        .await?
                {
                    return Ok(());
                }
                last_id = event.id;
            }
            debug!(count = events.len(), cursor = %last_id, "poll batch forwarded");

            if drained {
                tokio::select! {
                    _ = shutdown.cancelled() => return Ok(()),
                    _ = tokio::time::sleep(self.config.poll_interval) => {}
                }
            }
        }
    }
}
