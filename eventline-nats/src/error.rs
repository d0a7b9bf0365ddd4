//! Error types for the NATS drivers

use thiserror::Error;

/// Errors raised while setting NATS-backed components up
#[derive(Debug, Error)]
pub enum NatsError {
    #[error("NATS connection error: {0}")]
    Connection(String),

    #[error("JetStream error: {0}")]
    JetStream(String),

    #[error("KV store error: {0}")]
    KvStore(String),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type for NATS driver setup
pub type NatsResult<T> = std::result::Result<T, NatsError>;
