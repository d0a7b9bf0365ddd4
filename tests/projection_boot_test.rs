//! Boot, freeze/unfreeze and rebuild scenarios over the full in-process
//! wiring: store → forwarder → bus → bootable projection.

mod fixtures;

use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use eventline::feed::poller::{PollConfig, PollFeeder};
use eventline::forwarder::Forwarder;
use eventline::partition::PartitionSlot;
use eventline::projection::boot::{rebuild, BootConfig, BootableProjection};
use eventline::projection::EventBus;
use eventline::sink::memory::MemorySink;
use eventline::store::memory::MemoryStore;
use eventline::worker::lock::MemoryLocks;
use eventline::worker::Runnable;

use fixtures::{seed, RecordingProjection};

struct Pipeline {
    store: MemoryStore,
    bus: MemorySink,
    shutdown: CancellationToken,
    forwarder_task: tokio::task::JoinHandle<()>,
}

/// Store plus a running single-partition forwarder onto the bus.
async fn pipeline() -> Pipeline {
    let store = MemoryStore::new();
    let bus = MemorySink::new(1);
    let forwarder = Arc::new(Forwarder::new(
        "forwarder-1-1",
        Arc::new(PollFeeder::new(
            Arc::new(store.clone()),
            PollConfig {
                poll_interval: Duration::from_millis(20),
                trailing_lag: Duration::from_millis(50),
                partitions: 1,
                slot: PartitionSlot { from: 1, to: 1 },
                ..PollConfig::default()
            },
        )),
        Arc::new(bus.clone()),
    ));
    let shutdown = CancellationToken::new();
    let forwarder_task = {
        let forwarder = forwarder.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            forwarder.run(shutdown).await.unwrap();
        })
    };
    Pipeline {
        store,
        bus,
        shutdown,
        forwarder_task,
    }
}

fn bootable(
    projection: Arc<RecordingProjection>,
    pipeline: &Pipeline,
) -> Arc<BootableProjection> {
    BootableProjection::new(
        projection,
        Arc::new(pipeline.bus.clone()),
        Arc::new(pipeline.store.clone()),
        BootConfig {
            partitions_low: 1,
            partitions_hi: 1,
            trailing_lag: Duration::from_millis(50),
            freeze_timeout: Duration::from_secs(1),
        },
    )
}

#[tokio::test]
async fn boot_sees_history_and_live_stream() {
    let p = pipeline().await;
    seed(&p.store, "acc-1", 0, &["Created", "Deposited"]).await;
    tokio::time::sleep(Duration::from_millis(150)).await;

    let projection = RecordingProjection::new("balances");
    let manager = bootable(projection.clone(), &p);
    let shutdown = CancellationToken::new();
    manager.on_boot(&shutdown).await.unwrap();

    // History replayed from the store.
    assert_eq!(projection.len().await, 2);

    // Live events arrive through the bus consumer.
    let live = seed(&p.store, "acc-1", 2, &["Withdrawn"]).await;
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert!(projection.handled_ids().await.contains(&live));
    assert_eq!(projection.len().await, 3);

    shutdown.cancel();
    p.shutdown.cancel();
    p.forwarder_task.await.unwrap();
}

#[tokio::test]
async fn no_gap_for_events_inserted_during_boot() {
    let p = pipeline().await;
    seed(&p.store, "acc-1", 0, &["Created"]).await;
    tokio::time::sleep(Duration::from_millis(150)).await;

    let projection = RecordingProjection::new("balances");
    let manager = bootable(projection.clone(), &p);

    // Insert concurrently with the boot: whichever boot step is active when
    // the event lands, it must reach the handler at least once, via the
    // tail replay or via the live consumer.
    let straggler_task = {
        let store = p.store.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(2)).await;
            seed(&store, "acc-2", 0, &["Created"]).await
        })
    };

    let shutdown = CancellationToken::new();
    manager.on_boot(&shutdown).await.unwrap();
    let straggler = straggler_task.await.unwrap();

    // Give the live consumer time in case the event arrived over the bus.
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert!(
        projection.handled_ids().await.contains(&straggler),
        "event inserted during boot was lost"
    );

    shutdown.cancel();
    p.shutdown.cancel();
    p.forwarder_task.await.unwrap();
}

#[tokio::test]
async fn freeze_unfreeze_over_the_control_topic() {
    let p = pipeline().await;
    seed(&p.store, "acc-1", 0, &["Created"]).await;

    let projection = RecordingProjection::new("balances");
    let manager = bootable(projection.clone(), &p);
    let shutdown = CancellationToken::new();
    let run_task = {
        let manager = manager.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { manager.run(shutdown).await })
    };
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(projection.len().await, 1);

    // Freeze lands via the control topic; waiters block.
    p.bus.freeze_projection("balances").await.unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;
    let waiter = {
        let manager = manager.clone();
        tokio::spawn(async move { manager.wait().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(!waiter.is_finished());

    // Events continue to flow on the write side while frozen.
    seed(&p.store, "acc-1", 1, &["Deposited"]).await;

    // Unfreeze: waiters resume and the projection reboots from its
    // persisted position, catching up on what it missed.
    p.bus.unfreeze_projection("balances").await.unwrap();
    tokio::time::timeout(Duration::from_secs(1), waiter)
        .await
        .expect("wait must unblock after unfreeze")
        .unwrap();
    tokio::time::sleep(Duration::from_millis(300)).await;
    assert_eq!(projection.len().await, 2);

    shutdown.cancel();
    tokio::time::timeout(Duration::from_secs(1), run_task)
        .await
        .expect("run loop must stop")
        .unwrap()
        .unwrap();
    p.shutdown.cancel();
    p.forwarder_task.await.unwrap();
}

#[tokio::test]
async fn rebuild_truncates_and_replays_from_scratch() {
    let p = pipeline().await;
    seed(&p.store, "acc-1", 0, &["Created", "Deposited"]).await;

    let projection = RecordingProjection::new("balances");
    let manager = bootable(projection.clone(), &p);
    let shutdown = CancellationToken::new();
    let run_task = {
        let manager = manager.clone();
        let shutdown = shutdown.clone();
        tokio::spawn(async move { manager.run(shutdown).await })
    };
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(projection.len().await, 2);

    let locks = MemoryLocks::new();
    {
        let projection = projection.clone();
        rebuild(
            &p.bus,
            &locks,
            "balances",
            Duration::from_millis(100),
            || async move {
                projection.handled.lock().await.clear();
                Ok(())
            },
        )
        .await
        .unwrap();
    }

    // After the unfreeze the projection replays the full history.
    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(projection.len().await, 2);

    shutdown.cancel();
    let _ = tokio::time::timeout(Duration::from_secs(1), run_task).await;
    p.shutdown.cancel();
    p.forwarder_task.await.unwrap();
}
