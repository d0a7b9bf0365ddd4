//! In-memory partitioned sink
//!
//! Backs the in-process fanout wiring: the same value implements the
//! producer-side [`Sinker`] contract and the consumer-side
//! [`EventBus`] contract, with per-partition topics held in memory. Also the
//! test substrate for feeders and projections.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::{broadcast, RwLock};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use super::{SinkError, SinkPosition, SinkResult, Sinker};
use crate::event::{Event, ResumeToken};
use crate::projection::{Action, BusError, BusResult, EventBus, Freezer, Notification, Projection};

const LIVE_CHANNEL_CAPACITY: usize = 1024;
const CONTROL_CHANNEL_CAPACITY: usize = 64;

#[derive(Debug, Clone)]
struct Published {
    partition: u32,
    offset: u64,
    event: Event,
}

/// Partitioned in-memory bus.
///
/// `Clone` is cheap; all clones publish to and consume from the same topics.
#[derive(Clone)]
pub struct MemorySink {
    partitions: u32,
    topics: Arc<RwLock<HashMap<u32, Vec<Event>>>>,
    live: broadcast::Sender<Published>,
    control: broadcast::Sender<Notification>,
    closed: Arc<AtomicBool>,
}

impl MemorySink {
    /// Create a sink for a `partitions`-partition scheme (0 disables
    /// partitioning; everything lands on the all-partition).
    pub fn new(partitions: u32) -> Self {
        let (live, _) = broadcast::channel(LIVE_CHANNEL_CAPACITY);
        let (control, _) = broadcast::channel(CONTROL_CHANNEL_CAPACITY);
        Self {
            partitions,
            topics: Arc::new(RwLock::new(HashMap::new())),
            live,
            control,
            closed: Arc::new(AtomicBool::new(false)),
        }
    }

    /// All events published on a partition, in publish order.
    pub async fn published(&self, partition: u32) -> Vec<Event> {
        self.topics
            .read()
            .await
            .get(&partition)
            .cloned()
            .unwrap_or_default()
    }

    fn encode_offset(offset: u64) -> ResumeToken {
        offset.to_le_bytes().to_vec()
    }

    fn decode_offset(token: &[u8]) -> BusResult<u64> {
        if token.is_empty() {
            return Ok(0);
        }
        let bytes: [u8; 8] = token
            .try_into()
            .map_err(|_| BusError::Other(format!("invalid resume token of {} bytes", token.len())))?;
        Ok(u64::from_le_bytes(bytes))
    }
}

#[async_trait]
impl Sinker for MemorySink {
    async fn sink(&self, event: &Event) -> SinkResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SinkError::Closed);
        }
        let partition = event.partition(self.partitions);

        let mut topics = self.topics.write().await;
        let topic = topics.entry(partition).or_default();
        let offset = topic.len() as u64;
        topic.push(event.clone());
        drop(topics);

        debug!(partition, offset, event_id = %event.id, "event sunk");
        let _ = self.live.send(Published {
            partition,
            offset,
            event: event.clone(),
        });
        Ok(())
    }

    async fn last_message(&self, partition: u32) -> SinkResult<Option<SinkPosition>> {
        let topics = self.topics.read().await;
        Ok(topics.get(&partition).and_then(|t| t.last()).map(|e| SinkPosition {
            id: e.id,
            resume_token: e.resume_token.clone(),
        }))
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}

#[async_trait]
impl EventBus for MemorySink {
    async fn resume_token(&self, partition: u32) -> BusResult<ResumeToken> {
        let topics = self.topics.read().await;
        let offset = topics.get(&partition).map(|t| t.len() as u64).unwrap_or(0);
        Ok(Self::encode_offset(offset))
    }

    async fn start_consumer(
        &self,
        shutdown: CancellationToken,
        partition: u32,
        resume: ResumeToken,
        projection: Arc<dyn Projection>,
    ) -> BusResult<JoinHandle<()>> {
        let start = Self::decode_offset(&resume)?;

        // Subscribe before snapshotting the backlog so nothing published
        // during the switch is missed; duplicates are dropped by offset.
        let mut rx = self.live.subscribe();
        let topics = self.topics.read().await;
        let backlog: Vec<Event> = topics
            .get(&partition)
            .map(|t| t.iter().skip(start as usize).cloned().collect())
            .unwrap_or_default();
        drop(topics);
        let mut next_offset = start + backlog.len() as u64;

        let name = projection.name().to_string();
        let handle = tokio::spawn(async move {
            for event in &backlog {
                if shutdown.is_cancelled() {
                    return;
                }
                if let Err(e) = projection.handle(event).await {
                    error!(projection = %name, partition, error = %e, "consumer stopped on handler error");
                    return;
                }
            }
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    msg = rx.recv() => match msg {
                        Ok(published)
                            if published.partition == partition
                                && published.offset >= next_offset =>
                        {
                            if let Err(e) = projection.handle(&published.event).await {
                                error!(projection = %name, partition, error = %e, "consumer stopped on handler error");
                                return;
                            }
                            next_offset = published.offset + 1;
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Closed) => return,
                        Err(broadcast::error::RecvError::Lagged(n)) => {
                            warn!(projection = %name, partition, lagged = n, "consumer lagged behind the bus");
                        }
                    }
                }
            }
        });
        Ok(handle)
    }

    async fn start_notifier(
        &self,
        shutdown: CancellationToken,
        freezer: Arc<dyn Freezer>,
    ) -> BusResult<()> {
        let mut rx = self.control.subscribe();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return,
                    msg = rx.recv() => match msg {
                        Ok(notification) if notification.projection == freezer.name() => {
                            match notification.action {
                                Action::Freeze => {
                                    freezer.freeze().await;
                                }
                                Action::Unfreeze => freezer.unfreeze().await,
                            }
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Closed) => return,
                        Err(broadcast::error::RecvError::Lagged(_)) => {}
                    }
                }
            }
        });
        Ok(())
    }

    async fn freeze_projection(&self, name: &str) -> BusResult<()> {
        let _ = self.control.send(Notification {
            projection: name.to_string(),
            action: Action::Freeze,
        });
        Ok(())
    }

    async fn unfreeze_projection(&self, name: &str) -> BusResult<()> {
        let _ = self.control.send(Notification {
            projection: name.to_string(),
            action: Action::Unfreeze,
        });
        Ok(())
    }
}
