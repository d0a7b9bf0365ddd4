//! JetStream-backed sinker
//!
//! Publishes events on per-partition subjects of one persistent stream and
//! recovers the last acknowledged position per partition from the stream
//! itself, so no separate cursor storage is needed.

use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_nats::jetstream::{self, stream::LastRawMessageErrorKind, stream::Stream};
use async_trait::async_trait;
use tracing::debug;

use eventline::event::Event;
use eventline::sink::{SinkError, SinkPosition, SinkResult, Sinker};

use crate::error::{NatsError, NatsResult};
use crate::subject::Topic;

/// Configuration of the event stream.
#[derive(Debug, Clone)]
pub struct JetStreamConfig {
    /// JetStream stream name.
    pub stream_name: String,

    /// Topic root; partition subjects are `"<topic>.<n>"`.
    pub topic: String,

    /// Partition count of the scheme; 0 disables partitioning.
    pub partitions: u32,

    /// Maximum age of messages retained by the stream.
    pub max_age: Duration,
}

impl Default for JetStreamConfig {
    fn default() -> Self {
        Self {
            stream_name: "EVENTLINE".to_string(),
            topic: "eventline".to_string(),
            partitions: 0,
            max_age: Duration::from_secs(30 * 24 * 60 * 60),
        }
    }
}

pub(crate) async fn ensure_stream(
    jetstream: &jetstream::Context,
    config: &JetStreamConfig,
) -> NatsResult<Stream> {
    let topic = Topic::new(config.topic.clone());
    jetstream
        .get_or_create_stream(jetstream::stream::Config {
            name: config.stream_name.clone(),
            subjects: vec![topic.wildcard()],
            max_age: config.max_age,
            ..Default::default()
        })
        .await
        .map_err(|e| NatsError::JetStream(e.to_string()))
}

/// Partitioned sinker over one JetStream stream.
pub struct JetStreamSinker {
    jetstream: jetstream::Context,
    stream: Stream,
    topic: Topic,
    partitions: u32,
    closed: AtomicBool,
}

impl JetStreamSinker {
    pub async fn new(client: async_nats::Client, config: JetStreamConfig) -> NatsResult<Self> {
        let jetstream = jetstream::new(client);
        let stream = ensure_stream(&jetstream, &config).await?;
        Ok(Self {
            jetstream,
            stream,
            topic: Topic::new(config.topic),
            partitions: config.partitions,
            closed: AtomicBool::new(false),
        })
    }
}

#[async_trait]
impl Sinker for JetStreamSinker {
    async fn sink(&self, event: &Event) -> SinkResult<()> {
        if self.closed.load(Ordering::Acquire) {
            return Err(SinkError::Closed);
        }
        let subject = self.topic.partition(event.partition(self.partitions));
        let payload = serde_json::to_vec(event)?;

        // Double await: send, then wait for the broker's acknowledgment.
        // Only acknowledged messages count as published.
        let ack = self
            .jetstream
            .publish(subject.clone(), payload.into())
            .await
            .map_err(|e| SinkError::Transient(e.to_string()))?;
        let ack = ack
            .await
            .map_err(|e| SinkError::Transient(e.to_string()))?;

        debug!(subject = %subject, event_id = %event.id, sequence = ack.sequence, "event published");
        Ok(())
    }

    async fn last_message(&self, partition: u32) -> SinkResult<Option<SinkPosition>> {
        let subject = self.topic.partition(partition);
        match self.stream.get_last_raw_message_by_subject(&subject).await {
            Ok(message) => {
                let event: Event = serde_json::from_slice(&message.payload)?;
                Ok(Some(SinkPosition {
                    id: event.id,
                    resume_token: event.resume_token,
                }))
            }
            Err(e) if e.kind() == LastRawMessageErrorKind::NoMessageFound => Ok(None),
            Err(e) => Err(SinkError::Transient(e.to_string())),
        }
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::Release);
    }
}
