//! Push feeder over a store-native change stream
//!
//! Consumes inserts as the store announces them instead of polling. Ordering
//! per aggregate is inherited from the change stream; events of different
//! aggregates may interleave out of ID order, which the protocol permits.
//! Reconnects on disconnect from the most recent resume cursor.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::{Backoff, FeedResult, Feeder};
use crate::event::{Event, Filter, ResumeToken};
use crate::partition::{PartitionSlot, ALL_PARTITION};
use crate::sink::{resume_position, Sinker};
use crate::store::ChangeSource;

const RECONNECT_BASE: Duration = Duration::from_millis(250);
const RECONNECT_CAP: Duration = Duration::from_secs(10);

/// Tuning knobs of a [`PushFeeder`].
#[derive(Debug, Clone)]
pub struct PushConfig {
    /// Partition count of the scheme; 0 disables partitioning.
    pub partitions: u32,

    /// Partition range owned by this feeder.
    pub slot: PartitionSlot,

    /// Only these aggregate types; empty means all.
    pub aggregate_types: Vec<String>,

    /// Label constraints forwarded to the change-stream filter.
    pub labels: BTreeMap<String, Vec<String>>,
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            partitions: 0,
            slot: PartitionSlot::all(),
            aggregate_types: Vec::new(),
            labels: BTreeMap::new(),
        }
    }
}

impl PushConfig {
    fn filter(&self) -> Filter {
        let mut filter = Filter::new()
            .with_aggregate_types(self.aggregate_types.clone())
            .with_partitions(self.partitions, self.slot.from, self.slot.to);
        filter.labels = self.labels.clone();
        filter
    }
}

/// Change-stream feeder over a [`ChangeSource`].
pub struct PushFeeder {
    source: Arc<dyn ChangeSource>,
    config: PushConfig,
}

impl PushFeeder {
    pub fn new(source: Arc<dyn ChangeSource>, config: PushConfig) -> Self {
        Self { source, config }
    }

    /// Cursor recorded with the sink's earliest last-acknowledged message in
    /// the owned range, if any. An empty cursor (events sunk by a polling
    /// feeder carry none) falls back to the store's own start semantics.
    async fn starting_cursor(&self, sinker: &dyn Sinker) -> FeedResult<Option<ResumeToken>> {
        let (low, hi) = if self.config.partitions == 0 {
            (ALL_PARTITION, ALL_PARTITION)
        } else {
            (self.config.slot.from, self.config.slot.to)
        };
        let position = resume_position(sinker, low, hi).await?;
        Ok(position
            .map(|p| p.resume_token)
            .filter(|token| !token.is_empty()))
    }

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
impl Feeder for PushFeeder {
    async fn feed(&self, shutdown: CancellationToken, sinker: Arc<dyn Sinker>) -> FeedResult<()> {
        let filter = self.config.filter();
        let mut backoff = Backoff::new(RECONNECT_BASE, RECONNECT_CAP);
        let mut cursor = self.starting_cursor(sinker.as_ref()).await?;
        info!(
            slot = %self.config.slot.label(),
            resuming = cursor.is_some(),
            "push feeder starting"
        );

        'reconnect: loop {
            if shutdown.is_cancelled() {
                return Ok(());
            }
            let mut stream = match self.source.watch(cursor.clone(), &filter).await {
                Ok(stream) => {
                    backoff.reset();
                    stream
                }
                Err(e) if e.is_transient() => {
                    warn!(error = %e, "change stream open failed, backing off");
                    if !backoff.wait(&shutdown).await {
                        return Ok(());
                    }
                    continue;
                }
                Err(e) => return Err(e.into()),
            };

            loop {
                let item = tokio::select! {
                    _ = shutdown.cancelled() => return Ok(()),
                    item = stream.next() => item,
                };
                match item {
                    Some(Ok(event)) => {
                        // The stream filter already restricted the scan; this
                        // guards against a driver yielding rows outside the
                        // owned range.
                        let in_range = self.config.partitions == 0
                            || self
                                .config
                                .slot
                                .contains(event.partition(self.config.partitions));
                        if in_range
                            && !self
                                .sink_event(&shutdown, sinker.as_ref(), &mut backoff, &event)
                                .await?
                        {
                            return Ok(());
                        }
                        cursor = Some(event.resume_token);
                    }
                    Some(Err(e)) if e.is_transient() => {
                        warn!(error = %e, "change stream interrupted, reconnecting");
                        if !backoff.wait(&shutdown).await {
                            return Ok(());
                        }
                        continue 'reconnect;
                    }
                    Some(Err(e)) => return Err(e.into()),
                    None => {
                        warn!("change stream ended, reconnecting");
                        if !backoff.wait(&shutdown).await {
                            return Ok(());
                        }
                        continue 'reconnect;
                    }
                }
            }
        }
    }
}
