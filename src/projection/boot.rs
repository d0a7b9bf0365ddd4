//! Bootable projection lifecycle
//!
//! Drives a projection through `Idle → Booting → Live → Frozen → Idle`.
//! The boot sequence guarantees no gap between history replay and the live
//! stream: the bus cursor is captured *before* the tail replay, so any event
//! inserted during the switch is delivered either by the tail replay or by
//! the live consumer, possibly by both; the handler's idempotency absorbs
//! the overlap.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::player::Player;
use super::{EventBus, Freezer, Projection, ProjectionError, ProjectionResult};
use crate::event::Filter;
use crate::store::EventReader;
use crate::worker::lock::Locker;
use crate::worker::{BoxError, Runnable};

/// Knobs of a [`BootableProjection`].
#[derive(Debug, Clone)]
pub struct BootConfig {
    /// First partition consumed (inclusive, 1-based); 0 disables
    /// partitioning.
    pub partitions_low: u32,

    /// Last partition consumed (inclusive, 1-based).
    pub partitions_hi: u32,

    /// Safety window: the persisted resume position is moved back by this
    /// much before replay to cover write-visibility skew.
    pub trailing_lag: Duration,

    /// Bounded wait for a consumer to close during freeze.
    pub freeze_timeout: Duration,
}

impl Default for BootConfig {
    fn default() -> Self {
        Self {
            partitions_low: 0,
            partitions_hi: 0,
            trailing_lag: Duration::from_millis(250),
            freeze_timeout: Duration::from_secs(1),
        }
    }
}

#[derive(Default)]
struct BootState {
    boot_token: Option<CancellationToken>,
    consumers: Vec<JoinHandle<()>>,
    has_lock: bool,
    notifier_started: bool,
}

/// Manages one projection instance over a partition range.
pub struct BootableProjection {
    projection: Arc<dyn Projection>,
    bus: Arc<dyn EventBus>,
    player: Player,
    config: BootConfig,
    state: Mutex<BootState>,
    frozen: watch::Sender<bool>,
    me: std::sync::Weak<Self>,
}

impl BootableProjection {
    pub fn new(
        projection: Arc<dyn Projection>,
        bus: Arc<dyn EventBus>,
        reader: Arc<dyn EventReader>,
        config: BootConfig,
    ) -> Arc<Self> {
        let (frozen, _) = watch::channel(false);
        Arc::new_cyclic(|me| Self {
            projection,
            bus,
            player: Player::new(reader),
            config,
            state: Mutex::new(BootState::default()),
            frozen,
            me: me.clone(),
        })
    }

    pub fn name(&self) -> &str {
        self.projection.name()
    }

    fn partition_range(&self) -> std::ops::RangeInclusive<u32> {
        self.config.partitions_low..=self.config.partitions_hi
    }

    /// Block until the projection is not frozen.
    pub async fn wait(&self) {
        let mut rx = self.frozen.subscribe();
        let _ = rx.wait_for(|frozen| !*frozen).await;
    }

    /// Replay history, capture bus cursors, replay the tail, then go live.
    pub async fn on_boot(&self, shutdown: &CancellationToken) -> ProjectionResult<()> {
        let token = shutdown.child_token();
        let filter = Filter::new().with_aggregate_types(self.projection.aggregate_types());

        // Re-read from slightly before the persisted position: an event
        // committed around the last shutdown may have become visible late.
        let resume = self
            .projection
            .resume_event_id()
            .await?
            .delay(self.config.trailing_lag);
        info!(projection = %self.name(), from = %resume, "booting");

        let replayed = self
            .player
            .replay(self.projection.as_ref(), resume, &filter)
            .await?;

        // Bus cursors captured before the tail replay: everything published
        // after this point reaches the live consumers.
        let mut tokens = Vec::new();
        for partition in self.partition_range() {
            tokens.push(self.bus.resume_token(partition).await?);
        }

        // Events that landed between the first replay and the cursor capture.
        self.player
            .replay(self.projection.as_ref(), replayed, &filter)
            .await?;

        let mut consumers = Vec::new();
        for (partition, resume_token) in self.partition_range().zip(tokens) {
            let handle = self
                .bus
                .start_consumer(
                    token.clone(),
                    partition,
                    resume_token,
                    self.projection.clone(),
                )
                .await?;
            consumers.push(handle);
        }

        let mut state = self.state.lock().await;
        if !state.notifier_started {
            let freezer = self
                .me
                .upgrade()
                .expect("bootable projection dropped while booting");
            self.bus
                .start_notifier(shutdown.clone(), freezer as Arc<dyn Freezer>)
                .await?;
            state.notifier_started = true;
        }
        state.boot_token = Some(token);
        state.consumers = consumers;
        state.has_lock = true;
        info!(projection = %self.name(), "live");
        Ok(())
    }

    /// Cancel the boot context and join the consumers, bounded per consumer.
    async fn shut_consumers(&self) -> bool {
        let mut state = self.state.lock().await;
        if let Some(token) = state.boot_token.take() {
            token.cancel();
        }
        let consumers = std::mem::take(&mut state.consumers);
        let had_lock = state.has_lock;
        state.has_lock = false;
        drop(state);

        for handle in consumers {
            if tokio::time::timeout(self.config.freeze_timeout, handle)
                .await
                .is_err()
            {
                warn!(projection = %self.name(), "consumer did not close in time");
            }
        }
        had_lock
    }
}

#[async_trait]
impl Freezer for BootableProjection {
    fn name(&self) -> &str {
        self.projection.name()
    }

    async fn freeze(&self) -> bool {
        self.frozen.send_replace(true);
        let had_lock = self.shut_consumers().await;
        info!(projection = %self.name(), had_lock, "frozen");
        had_lock
    }

    async fn unfreeze(&self) {
        self.frozen.send_replace(false);
        info!(projection = %self.name(), "unfrozen");
    }
}

#[async_trait]
impl Runnable for BootableProjection {
    /// Worker loop: boot, stay live until frozen or cancelled, and re-boot
    /// from the persisted resume position after each unfreeze.
    async fn run(&self, shutdown: CancellationToken) -> Result<(), BoxError> {
        loop {
            let mut rx = self.frozen.subscribe();
            tokio::select! {
                _ = shutdown.cancelled() => {
                    self.shut_consumers().await;
                    return Ok(());
                }
                is_err = async { rx.wait_for(|frozen| !*frozen).await.is_err() } => {
                    if is_err {
                        return Ok(());
                    }
                }
            }

            self.on_boot(&shutdown).await?;

            let mut rx = self.frozen.subscribe();
            tokio::select! {
                _ = shutdown.cancelled() => {
                    self.shut_consumers().await;
                    return Ok(());
                }
                is_err = async { rx.wait_for(|frozen| *frozen).await.is_err() } => {
                    if is_err {
                        return Ok(());
                    }
                    // Freeze already shut the consumers unless it raced the
                    // boot; shutting again is a no-op in the normal case.
                    self.shut_consumers().await;
                }
            }
        }
    }
}

/// Fleet-wide rebuild: freeze the projection everywhere, truncate its state,
/// then unfreeze. Guarded by a global freeze lock so only one rebuild of a
/// projection runs at a time.
pub async fn rebuild<F, Fut>(
    bus: &dyn EventBus,
    locker: &dyn Locker,
    projection_name: &str,
    settle: Duration,
    truncate: F,
) -> ProjectionResult<()>
where
    F: FnOnce() -> Fut,
    Fut: std::future::Future<Output = ProjectionResult<()>>,
{
    let lock_name = format!("freeze-{projection_name}");
    let lease = locker
        .acquire(&lock_name, settle * 10)
        .await?
        .ok_or_else(|| ProjectionError::RebuildInProgress(projection_name.to_string()))?;

    bus.freeze_projection(projection_name).await?;
    // Bounded wait for every partition consumer to observe the freeze.
    tokio::time::sleep(settle).await;

    let result = truncate().await;

    bus.unfreeze_projection(projection_name).await?;
    if let Err(e) = lease.release().await {
        warn!(projection = %projection_name, error = %e, "freeze lock release failed");
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Event, EventDetail, EventRecord};
    use crate::eventid::EventId;
    use crate::sink::memory::MemorySink;
    use crate::sink::Sinker;
    use crate::store::memory::MemoryStore;
    use crate::store::EventRepository;
    use crate::worker::lock::MemoryLocks;
    use chrono::Utc;
    use std::collections::BTreeMap;
    use std::sync::atomic::{AtomicU32, Ordering};

    /// Counts handled events and remembers the highest ID as its resume
    /// position, like a real read model would persist.
    struct CountingProjection {
        handled: Mutex<Vec<EventId>>,
        count: AtomicU32,
    }

    impl CountingProjection {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                handled: Mutex::new(Vec::new()),
                count: AtomicU32::new(0),
            })
        }
    }

    #[async_trait]
    impl Projection for CountingProjection {
        fn name(&self) -> &str {
            "counting"
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
                .max()
                .copied()
                .unwrap_or_else(EventId::zero))
        }

        async fn handle(&self, event: &Event) -> ProjectionResult<()> {
            let mut handled = self.handled.lock().await;
            // Idempotent: re-delivery across the boot switch is expected.
            if !handled.contains(&event.id) {
                handled.push(event.id);
                self.count.fetch_add(1, Ordering::Release);
            }
            Ok(())
        }
    }

    async fn save(store: &MemoryStore, aggregate_id: &str, version: u32, kind: &str) -> EventId {
        let (id, _) = store
            .save_event(&EventRecord {
                aggregate_id: aggregate_id.to_string(),
                version,
                aggregate_type: "account".to_string(),
                idempotency_key: String::new(),
                labels: BTreeMap::new(),
                created_at: Utc::now(),
                details: vec![EventDetail {
                    kind: kind.to_string(),
                    body: b"{}".to_vec(),
                }],
            })
            .await
            .unwrap();
        id
    }

    fn bootable(
        projection: Arc<CountingProjection>,
        bus: &MemorySink,
        store: &MemoryStore,
    ) -> Arc<BootableProjection> {
        BootableProjection::new(
            projection,
            Arc::new(bus.clone()),
            Arc::new(store.clone()),
            BootConfig {
                partitions_low: 1,
                partitions_hi: 1,
                trailing_lag: Duration::from_millis(50),
                freeze_timeout: Duration::from_secs(1),
            },
        )
    }

    /// Forward stored events onto the bus, as a forwarder would.
    async fn publish_all(store: &MemoryStore, bus: &MemorySink) {
        for event in store
            .get_events(EventId::zero(), 0, Duration::ZERO, &Filter::new())
            .await
            .unwrap()
        {
            bus.sink(&event).await.unwrap();
        }
    }

    #[tokio::test]
    async fn test_boot_replays_history_then_consumes_live() {
        let store = MemoryStore::new();
        let bus = MemorySink::new(1);
        save(&store, "acc-1", 0, "Created").await;
        publish_all(&store, &bus).await;

        let projection = CountingProjection::new();
        let manager = bootable(projection.clone(), &bus, &store);

        let shutdown = CancellationToken::new();
        manager.on_boot(&shutdown).await.unwrap();
        assert_eq!(projection.count.load(Ordering::Acquire), 1);

        // A live event reaches the handler through the bus consumer.
        let event = save(&store, "acc-1", 1, "Deposited").await;
        publish_all(&store, &bus).await;
        tokio::time::sleep(Duration::from_millis(50)).await;

        assert_eq!(projection.count.load(Ordering::Acquire), 2);
        assert!(projection.handled.lock().await.contains(&event));
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_boot_covers_events_inserted_during_the_switch() {
        let store = MemoryStore::new();
        let bus = MemorySink::new(1);
        save(&store, "acc-1", 0, "Created").await;

        // The event lands in the store after the first replay would have
        // finished but is never published to the bus; only the tail replay
        // can deliver it.
        let projection = CountingProjection::new();
        let manager = bootable(projection.clone(), &bus, &store);
        let straggler = save(&store, "acc-2", 0, "Created").await;

        let shutdown = CancellationToken::new();
        manager.on_boot(&shutdown).await.unwrap();

        assert!(projection.handled.lock().await.contains(&straggler));
        assert_eq!(projection.count.load(Ordering::Acquire), 2);
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_freeze_reports_lock_and_blocks_wait() {
        let store = MemoryStore::new();
        let bus = MemorySink::new(1);
        let projection = CountingProjection::new();
        let manager = bootable(projection.clone(), &bus, &store);

        let shutdown = CancellationToken::new();
        manager.on_boot(&shutdown).await.unwrap();

        assert!(manager.freeze().await);
        // A second freeze no longer holds anything.
        assert!(!manager.freeze().await);

        // Wait blocks while frozen.
        let waiter = {
            let manager = manager.clone();
            tokio::spawn(async move {
                manager.wait().await;
            })
        };
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!waiter.is_finished());

        manager.unfreeze().await;
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .expect("wait must unblock after unfreeze")
            .unwrap();
        shutdown.cancel();
    }

    #[tokio::test]
    async fn test_run_loop_reboots_after_unfreeze() {
        let store = MemoryStore::new();
        let bus = MemorySink::new(1);
        save(&store, "acc-1", 0, "Created").await;

        let projection = CountingProjection::new();
        let manager = bootable(projection.clone(), &bus, &store);

        let shutdown = CancellationToken::new();
        let task = {
            let manager = manager.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { manager.run(shutdown).await })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(projection.count.load(Ordering::Acquire), 1);

        // Freeze via the control topic, insert while frozen, unfreeze: the
        // re-boot replays from the persisted resume position and picks the
        // new event up.
        bus.freeze_projection("counting").await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        save(&store, "acc-1", 1, "Deposited").await;

        bus.unfreeze_projection("counting").await.unwrap();
        tokio::time::sleep(Duration::from_millis(150)).await;
        assert_eq!(projection.count.load(Ordering::Acquire), 2);

        shutdown.cancel();
        tokio::time::timeout(Duration::from_secs(1), task)
            .await
            .expect("run loop must stop on cancellation")
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_rebuild_freezes_truncates_and_unfreezes() {
        let store = MemoryStore::new();
        let bus = MemorySink::new(1);
        save(&store, "acc-1", 0, "Created").await;

        let projection = CountingProjection::new();
        let manager = bootable(projection.clone(), &bus, &store);
        let shutdown = CancellationToken::new();
        let task = {
            let manager = manager.clone();
            let shutdown = shutdown.clone();
            tokio::spawn(async move { manager.run(shutdown).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(projection.count.load(Ordering::Acquire), 1);

        let locks = MemoryLocks::new();
        let truncated = {
            let projection = projection.clone();
            rebuild(&bus, &locks, "counting", Duration::from_millis(50), || async move {
                projection.handled.lock().await.clear();
                projection.count.store(0, Ordering::Release);
                Ok(())
            })
        };
        truncated.await.unwrap();

        // After unfreeze the run loop boots again and replays everything.
        tokio::time::sleep(Duration::from_millis(200)).await;
        assert_eq!(projection.count.load(Ordering::Acquire), 1);

        shutdown.cancel();
        let _ = tokio::time::timeout(Duration::from_secs(1), task).await;
    }
}
