//! NATS JetStream drivers for the eventline runtime
//!
//! Implements the bus-facing contracts of `eventline` over NATS:
//! [`JetStreamSinker`] publishes on per-partition subjects of one persistent
//! stream, [`JetStreamBus`] consumes them for projections with resume
//! tokens and a freeze/unfreeze control subject, and the KV-backed
//! [`KvMemberList`] and [`KvLocker`] provide membership and lease locks for
//! the balancer.

pub mod client;
pub mod consumer;
pub mod error;
pub mod lock;
pub mod membership;
pub mod sinker;
pub mod subject;

pub use client::{connect, NatsConfig};
pub use consumer::JetStreamBus;
pub use error::{NatsError, NatsResult};
pub use lock::KvLocker;
pub use membership::{KvMemberConfig, KvMemberList};
pub use sinker::{JetStreamConfig, JetStreamSinker};
pub use subject::Topic;
