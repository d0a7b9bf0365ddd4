//! Workers: startable, stoppable, lock-guarded units
//!
//! A worker wraps a long-running task (a forwarder or a projection) behind
//! the fleet-wide invariant that at most one live instance of a given worker
//! name exists at any time. Start acquires the distributed lock and spawns
//! the task plus a lease-refresh loop; losing the lease stops the task.

pub mod balancer;
pub mod lock;
pub mod membership;

use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use self::lock::Locker;

/// Boxed error for worker task outcomes.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// A long-running task drivable by a worker.
#[async_trait]
pub trait Runnable: Send + Sync {
    /// Run until `shutdown` is cancelled. An error is fatal for this worker;
    /// the balancer leaves the slot open for a peer.
    async fn run(&self, shutdown: CancellationToken) -> Result<(), BoxError>;
}

/// A balanceable unit of work.
#[async_trait]
pub trait Worker: Send + Sync {
    /// Name unique within the member-list namespace, e.g. `forwarder-7-12`.
    fn name(&self) -> &str;

    fn is_running(&self) -> bool;

    /// Try to start. Returns `false` when the distributed lock could not be
    /// acquired. Idempotent: starting a running worker reports `true`.
    async fn start(&self, shutdown: &CancellationToken) -> bool;

    /// Cancel and join the task. Idempotent.
    async fn stop(&self);
}

/// Lifecycle knobs of a [`LockedWorker`].
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Lease duration of the distributed lock; refresh runs at `ttl/2`.
    pub lock_ttl: Duration,

    /// How long Stop waits for the task to observe cancellation before
    /// declaring it hung.
    pub stop_grace: Duration,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            lock_ttl: Duration::from_secs(10),
            stop_grace: Duration::from_secs(5),
        }
    }
}

struct RunningState {
    token: CancellationToken,
    run_task: JoinHandle<()>,
    refresh_task: JoinHandle<()>,
}

/// A worker guarding its [`Runnable`] with a distributed lock.
pub struct LockedWorker {
    name: String,
    locker: std::sync::Arc<dyn Locker>,
    runnable: std::sync::Arc<dyn Runnable>,
    config: WorkerConfig,
    state: Mutex<Option<RunningState>>,
}

impl LockedWorker {
    pub fn new(
        name: impl Into<String>,
        locker: std::sync::Arc<dyn Locker>,
        runnable: std::sync::Arc<dyn Runnable>,
        config: WorkerConfig,
    ) -> Self {
        Self {
            name: name.into(),
            locker,
            runnable,
            config,
            state: Mutex::new(None),
        }
    }

    /// Reap a finished task, if any, so a dead worker can be restarted.
    fn take_if_finished(&self) -> bool {
        let mut state = self.state.lock().expect("worker state poisoned");
        match state.as_ref() {
            Some(running) if running.run_task.is_finished() => {
                *state = None;
                false
            }
            Some(_) => true,
            None => false,
        }
    }
}

#[async_trait]
impl Worker for LockedWorker {
    fn name(&self) -> &str {
        &self.name
    }

    fn is_running(&self) -> bool {
        self.state
            .lock()
            .expect("worker state poisoned")
            .as_ref()
            .map_or(false, |running| !running.run_task.is_finished())
    }

    async fn start(&self, shutdown: &CancellationToken) -> bool {
        if self.take_if_finished() {
            return true;
        }

        let lease = match self.locker.acquire(&self.name, self.config.lock_ttl).await {
            Ok(Some(lease)) => lease,
            Ok(None) => return false,
            Err(e) => {
                warn!(worker = %self.name, error = %e, "lock acquisition failed");
                return false;
            }
        };
        info!(worker = %self.name, "worker starting");

        let token = shutdown.child_token();

        let refresh_task = {
            let token = token.clone();
            let lease = lease.clone();
            let name = self.name.clone();
            let mut interval = tokio::time::interval(self.config.lock_ttl / 2);
            tokio::spawn(async move {
                interval.tick().await;
                loop {
                    tokio::select! {
                        _ = token.cancelled() => return,
                        _ = interval.tick() => {
                            if let Err(e) = lease.refresh().await {
                                error!(worker = %name, error = %e, "lock refresh failed, stopping worker");
                                token.cancel();
                                return;
                            }
                        }
                    }
                }
            })
        };

        let run_task = {
            let token = token.clone();
            let runnable = self.runnable.clone();
            let name = self.name.clone();
            tokio::spawn(async move {
                match runnable.run(token.clone()).await {
                    Ok(()) => info!(worker = %name, "worker stopped"),
                    Err(e) => error!(worker = %name, error = %e, "worker failed"),
                }
                // Stops the refresh loop and frees the slot for a peer.
                token.cancel();
                if let Err(e) = lease.release().await {
                    warn!(worker = %name, error = %e, "lock release failed");
                }
            })
        };

        let mut state = self.state.lock().expect("worker state poisoned");
        *state = Some(RunningState {
            token,
            run_task,
            refresh_task,
        });
        true
    }

    async fn stop(&self) {
        let running = match self.state.lock().expect("worker state poisoned").take() {
            Some(running) => running,
            None => return,
        };
        running.token.cancel();

        match tokio::time::timeout(self.config.stop_grace, running.run_task).await {
            Ok(_) => info!(worker = %self.name, "worker stopped cleanly"),
            Err(_) => {
                warn!(worker = %self.name, grace = ?self.config.stop_grace, "worker hung on stop");
            }
        }
        let _ = tokio::time::timeout(self.config.stop_grace, running.refresh_task).await;
    }
}

#[cfg(test)]
mod tests {
    use super::lock::MemoryLocks;
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    struct TickUntilCancelled {
        ticks: AtomicU32,
    }

    #[async_trait]
    impl Runnable for TickUntilCancelled {
        async fn run(&self, shutdown: CancellationToken) -> Result<(), BoxError> {
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => return Ok(()),
                    _ = tokio::time::sleep(Duration::from_millis(5)) => {
                        self.ticks.fetch_add(1, Ordering::Relaxed);
                    }
                }
            }
        }
    }

    fn worker_pair(locks: &MemoryLocks, name: &str) -> (Arc<LockedWorker>, Arc<TickUntilCancelled>) {
        let runnable = Arc::new(TickUntilCancelled {
            ticks: AtomicU32::new(0),
        });
        let worker = Arc::new(LockedWorker::new(
            name,
            Arc::new(locks.clone()),
            runnable.clone(),
            WorkerConfig {
                lock_ttl: Duration::from_millis(200),
                stop_grace: Duration::from_millis(500),
            },
        ));
        (worker, runnable)
    }

    #[tokio::test]
    async fn test_start_runs_task_and_stop_joins_it() {
        let locks = MemoryLocks::new();
        let (worker, runnable) = worker_pair(&locks, "forwarder-1-4");
        let shutdown = CancellationToken::new();

        assert!(worker.start(&shutdown).await);
        assert!(worker.is_running());

        tokio::time::sleep(Duration::from_millis(40)).await;
        worker.stop().await;
        assert!(!worker.is_running());
        assert!(runnable.ticks.load(Ordering::Relaxed) > 0);
    }

    #[tokio::test]
    async fn test_start_is_refused_while_peer_holds_lock() {
        let locks = MemoryLocks::new();
        let (first, _) = worker_pair(&locks, "forwarder-1-4");
        let (second, _) = worker_pair(&locks, "forwarder-1-4");
        let shutdown = CancellationToken::new();

        assert!(first.start(&shutdown).await);
        assert!(!second.start(&shutdown).await);

        first.stop().await;
        assert!(second.start(&shutdown).await);
        second.stop().await;
    }

    #[tokio::test]
    async fn test_start_is_idempotent() {
        let locks = MemoryLocks::new();
        let (worker, _) = worker_pair(&locks, "forwarder-1-4");
        let shutdown = CancellationToken::new();

        assert!(worker.start(&shutdown).await);
        assert!(worker.start(&shutdown).await);
        worker.stop().await;
        worker.stop().await;
    }

    #[tokio::test]
    async fn test_lock_release_on_stop_frees_the_name() {
        let locks = MemoryLocks::new();
        let (worker, _) = worker_pair(&locks, "forwarder-1-4");
        let shutdown = CancellationToken::new();

        worker.start(&shutdown).await;
        assert!(locks.holder("forwarder-1-4").is_some());
        worker.stop().await;
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(locks.holder("forwarder-1-4").is_none());
    }

    struct FailImmediately;

    #[async_trait]
    impl Runnable for FailImmediately {
        async fn run(&self, _shutdown: CancellationToken) -> Result<(), BoxError> {
            Err("schema mismatch".into())
        }
    }

    #[tokio::test]
    async fn test_fatal_task_error_frees_the_slot() {
        let locks = MemoryLocks::new();
        let worker = LockedWorker::new(
            "forwarder-1-4",
            Arc::new(locks.clone()),
            Arc::new(FailImmediately),
            WorkerConfig::default(),
        );
        let shutdown = CancellationToken::new();

        assert!(worker.start(&shutdown).await);
        tokio::time::sleep(Duration::from_millis(30)).await;

        // The task died; the worker reports not running and the lock is free
        // for a peer to pick the slot up.
        assert!(!worker.is_running());
        assert!(locks.holder("forwarder-1-4").is_none());
        assert!(worker.start(&shutdown).await);
        worker.stop().await;
    }

    #[tokio::test]
    async fn test_parent_cancellation_stops_the_task() {
        let locks = MemoryLocks::new();
        let (worker, _) = worker_pair(&locks, "forwarder-1-4");
        let shutdown = CancellationToken::new();

        worker.start(&shutdown).await;
        shutdown.cancel();
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert!(!worker.is_running());
    }
}
