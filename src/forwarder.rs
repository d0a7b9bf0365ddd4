//! Forwarder: one feeder bound to one sinker
//!
//! A thin composition that owns both ends of a partition range. `run` drives
//! the feeder until cancellation; `close` shuts the sinker down before the
//! feeder so no event is read that can no longer be published.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::feed::{FeedResult, Feeder};
use crate::sink::Sinker;

pub struct Forwarder {
    name: String,
    feeder: Arc<dyn Feeder>,
    sinker: Arc<dyn Sinker>,
}

impl Forwarder {
    pub fn new(name: impl Into<String>, feeder: Arc<dyn Feeder>, sinker: Arc<dyn Sinker>) -> Self {
        Self {
            name: name.into(),
            feeder,
            sinker,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Drive the feeder until `shutdown` is cancelled or a non-retryable
    /// error occurs.
    pub async fn run(&self, shutdown: CancellationToken) -> FeedResult<()> {
        info!(forwarder = %self.name, "forwarder running");
        self.feeder.feed(shutdown, self.sinker.clone()).await
    }

    /// Close the sinker, then the feeder. Idempotent.
    pub async fn close(&self) {
        self.sinker.close().await;
        self.feeder.close().await;
        info!(forwarder = %self.name, "forwarder closed");
    }
}

#[async_trait::async_trait]
impl crate::worker::Runnable for Forwarder {
    async fn run(&self, shutdown: CancellationToken) -> Result<(), crate::worker::BoxError> {
        Forwarder::run(self, shutdown).await?;
        Ok(())
    }
}
