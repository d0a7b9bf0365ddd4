//! Feeders: turn event-store inserts into an ordered stream
//!
//! A feeder is the source side of a forwarder. Two variants exist: the
//! [`poller`] trails the store by a safety lag and scans by event ID; the
//! [`notifier`] consumes a store-native change stream. Both resume from the
//! sinker's last acknowledged position and deliver at-least-once.

pub mod notifier;
pub mod poller;

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

use crate::sink::{SinkError, Sinker};
use crate::store::StoreError;

/// Errors surfaced by feeders. Transient store and sink failures are retried
/// internally; only non-retryable failures escape.
#[derive(Debug, Error)]
pub enum FeedError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Sink(#[from] SinkError),
}

/// Result type for feed operations
pub type FeedResult<T> = std::result::Result<T, FeedError>;

/// Source capability bound to a partition range of the store.
#[async_trait]
pub trait Feeder: Send + Sync {
    /// Drive events into the sinker until cancellation.
    ///
    /// Returns `Ok(())` on cancellation and an error only when a
    /// non-retryable failure occurs.
    async fn feed(&self, shutdown: CancellationToken, sinker: Arc<dyn Sinker>) -> FeedResult<()>;

    /// Release any source-side resources. Idempotent.
    async fn close(&self) {}
}

/// Exponential backoff for transient failures, doubling from `base` up to
/// `cap`.
pub(crate) struct Backoff {
    base: Duration,
    cap: Duration,
    current: Duration,
}

impl Backoff {
    pub(crate) fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            current: base,
        }
    }

    pub(crate) fn reset(&mut self) {
        self.current = self.base;
    }

    /// Sleep for the current delay, doubling it for next time. Returns
    /// `false` when cancelled during the wait.
    pub(crate) async fn wait(&mut self, shutdown: &CancellationToken) -> bool {
        let delay = self.current;
        self.current = (self.current * 2).min(self.cap);
        tokio::select! {
            _ = shutdown.cancelled() => false,
            _ = tokio::time::sleep(delay) => true,
        }
    }
}
