//! Event-sourcing runtime: ordered event log, change-data-capture feeders,
//! partitioned bus forwarding, and balanced projections.
//!
//! The write side appends immutable events per aggregate; feeders turn the
//! insert-only store into an ordered stream; forwarders publish it onto a
//! partitioned bus with at-least-once delivery; projections replay history
//! and switch to the live stream without gaps. A member list, lease locks
//! and a fair balancer spread the work across instances.
//!
//! Data flow: writer → store → feeder → forwarder → sinker → bus →
//! projection. Control flow: balancer owns worker lifecycles under the
//! member list and the distributed locks.
//!
//! Everything here is bus- and store-agnostic; the `eventline-nats` crate
//! provides the NATS JetStream drivers. The in-memory store and sink double
//! as the in-process wiring.

pub mod config;
pub mod event;
pub mod event_store;
pub mod eventid;
pub mod feed;
pub mod forwarder;
pub mod partition;
pub mod projection;
pub mod sink;
pub mod store;
pub mod worker;

// Re-export the types most wirings touch.
pub use config::Config;
pub use event::{Event, EventDetail, EventRecord, Filter, ForgetRequest, ResumeToken, Snapshot};
pub use event_store::{Aggregate, EventStore, PendingEvent, Root, SaveOptions, Upcaster};
pub use eventid::{EventId, EventIdError};
pub use feed::notifier::{PushConfig, PushFeeder};
pub use feed::poller::{PollConfig, PollFeeder};
pub use feed::{FeedError, Feeder};
pub use forwarder::Forwarder;
pub use partition::PartitionSlot;
pub use projection::boot::{rebuild, BootConfig, BootableProjection};
pub use projection::player::Player;
pub use projection::{BusError, EventBus, Freezer, Projection, ProjectionError};
pub use sink::{SinkError, SinkPosition, Sinker};
pub use store::{ChangeSource, EventReader, EventRepository, StoreError};
pub use worker::balancer::Balancer;
pub use worker::lock::{Lease, LockError, Locker};
pub use worker::membership::{MemberList, MemberWorkers};
pub use worker::{LockedWorker, Runnable, Worker, WorkerConfig};
