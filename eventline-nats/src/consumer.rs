//! JetStream-backed bus consumer for projections
//!
//! Per-partition pull consumers with explicit acknowledgment give
//! at-least-once delivery; resume tokens are stream sequences, so a consumer
//! started from a captured token sees exactly the messages published after
//! the capture. Freeze/unfreeze notifications ride a core NATS subject.

use std::sync::Arc;

use async_nats::jetstream::{
    self,
    consumer::{AckPolicy, DeliverPolicy},
    stream::{LastRawMessageErrorKind, Stream},
};
use async_trait::async_trait;
use futures::StreamExt;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use eventline::event::{Event, ResumeToken};
use eventline::projection::{Action, BusError, BusResult, EventBus, Freezer, Notification, Projection};

use crate::error::NatsResult;
use crate::sinker::{ensure_stream, JetStreamConfig};
use crate::subject::{decode_sequence, encode_sequence, Topic};

/// Consumer-side bus over the same stream the sinker publishes to.
pub struct JetStreamBus {
    client: async_nats::Client,
    stream: Stream,
    topic: Topic,
}

impl JetStreamBus {
    pub async fn new(client: async_nats::Client, config: JetStreamConfig) -> NatsResult<Self> {
        let jetstream = jetstream::new(client.clone());
        let stream = ensure_stream(&jetstream, &config).await?;
        Ok(Self {
            client,
            stream,
            topic: Topic::new(config.topic),
        })
    }

    async fn publish_notification(&self, notification: &Notification) -> BusResult<()> {
        let payload = serde_json::to_vec(notification)?;
        self.client
            .publish(self.topic.control(), payload.into())
            .await
            .map_err(|e| BusError::Transient(e.to_string()))?;
        self.client
            .flush()
            .await
            .map_err(|e| BusError::Transient(e.to_string()))?;
        Ok(())
    }
}

#[async_trait]
impl EventBus for JetStreamBus {
    async fn resume_token(&self, partition: u32) -> BusResult<ResumeToken> {
        let subject = self.topic.partition(partition);
        match self.stream.get_last_raw_message_by_subject(&subject).await {
            Ok(message) => Ok(encode_sequence(message.sequence)),
            Err(e) if e.kind() == LastRawMessageErrorKind::NoMessageFound => {
                Ok(encode_sequence(0))
            }
            Err(e) => Err(BusError::Transient(e.to_string())),
        }
    }

    async fn start_consumer(
        &self,
        shutdown: CancellationToken,
        partition: u32,
        resume: ResumeToken,
        projection: Arc<dyn Projection>,
    ) -> BusResult<JoinHandle<()>> {
        let after = decode_sequence(&resume).map_err(BusError::Other)?;
        let consumer = self
            .stream
            .create_consumer(jetstream::consumer::pull::Config {
                filter_subject: self.topic.partition(partition),
                deliver_policy: DeliverPolicy::ByStartSequence {
                    start_sequence: after + 1,
                },
                ack_policy: AckPolicy::Explicit,
                ..Default::default()
            })
            .await
            .map_err(|e| BusError::Transient(e.to_string()))?;
        let mut messages = consumer
            .messages()
            .await
            .map_err(|e| BusError::Transient(e.to_string()))?;

        let name = projection.name().to_string();
        info!(projection = %name, partition, after, "consumer started");
        let handle = tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    _ = shutdown.cancelled() => return,
                    message = messages.next() => message,
                };
                match message {
                    Some(Ok(message)) => {
                        let event: Event = match serde_json::from_slice(&message.payload) {
                            Ok(event) => event,
                            Err(e) => {
                                error!(projection = %name, partition, error = %e, "undecodable bus message");
                                return;
                            }
                        };
                        if let Err(e) = projection.handle(&event).await {
                            error!(projection = %name, partition, error = %e, "consumer stopped on handler error");
                            return;
                        }
                        // Unacked messages are re-delivered: at-least-once.
                        if let Err(e) = message.ack().await {
                            warn!(projection = %name, partition, error = %e, "ack failed");
                        }
                    }
                    Some(Err(e)) => {
                        error!(projection = %name, partition, error = %e, "consumer stream failed");
                        return;
                    }
                    None => return,
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
        let mut subscriber = self
            .client
            .subscribe(self.topic.control())
            .await
            .map_err(|e| BusError::Transient(e.to_string()))?;

        tokio::spawn(async move {
            loop {
                let message = tokio::select! {
                    _ = shutdown.cancelled() => return,
                    message = subscriber.next() => message,
                };
                let Some(message) = message else { return };
                let notification: Notification = match serde_json::from_slice(&message.payload) {
                    Ok(notification) => notification,
                    Err(e) => {
                        warn!(error = %e, "undecodable control message");
                        continue;
                    }
                };
                if notification.projection != freezer.name() {
                    continue;
                }
                match notification.action {
                    Action::Freeze => {
                        freezer.freeze().await;
                    }
                    Action::Unfreeze => freezer.unfreeze().await,
                }
            }
        });
        Ok(())
    }

    async fn freeze_projection(&self, name: &str) -> BusResult<()> {
        self.publish_notification(&Notification {
            projection: name.to_string(),
            action: Action::Freeze,
        })
        .await
    }

    async fn unfreeze_projection(&self, name: &str) -> BusResult<()> {
        self.publish_notification(&Notification {
            projection: name.to_string(),
            action: Action::Unfreeze,
        })
        .await
    }
}
