//! Core event data model
//!
//! Events are immutable facts about an aggregate at a version. The only
//! mutation permitted after write is the Forget rewrite of `body`, which
//! exists for data-erasure obligations.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::eventid::EventId;
use crate::partition;

/// Opaque per-partition cursor handed back by the bus, from which a feeder
/// knows where to resume. Empty means "no position recorded".
pub type ResumeToken = Vec<u8>;

/// A stored domain event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Time-sortable identifier, unique across the store.
    pub id: EventId,

    /// ID of the aggregate this event belongs to.
    pub aggregate_id: String,

    /// Stable hash of `aggregate_id`, persisted so feeders can filter by
    /// partition without re-hashing.
    pub aggregate_id_hash: u32,

    /// Version of the aggregate after this event (starts at 1).
    pub aggregate_version: u32,

    /// Aggregate type name, e.g. `"account"`.
    pub aggregate_type: String,

    /// Event kind, e.g. `"MoneyDeposited"`.
    pub kind: String,

    /// Serialized event payload.
    #[serde(with = "serde_bytes_b64")]
    pub body: Vec<u8>,

    /// Caller-supplied token making the producing save retryable; empty when
    /// none was supplied.
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub idempotency_key: String,

    /// Free-form tags, e.g. `{"geo": "EU"}`.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub labels: BTreeMap<String, String>,

    /// Commit timestamp, millisecond precision.
    pub created_at: DateTime<Utc>,

    /// Change-stream cursor captured when this event was read by a push
    /// feeder; empty for events read by polling.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resume_token: ResumeToken,
}

impl Event {
    /// Partition this event belongs to under an `N`-partition scheme.
    pub fn partition(&self, partitions: u32) -> u32 {
        partition::partition_of(self.aggregate_id_hash, partitions)
    }

    /// Whether this is the zero event.
    pub fn is_zero(&self) -> bool {
        self.id.is_zero()
    }
}

/// A point-in-time capture of an aggregate's state.
///
/// `id` refers to the event that produced this state; the referenced event
/// must never be removed while the snapshot exists.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    pub id: EventId,
    pub aggregate_id: String,
    pub aggregate_version: u32,
    pub aggregate_type: String,
    #[serde(with = "serde_bytes_b64")]
    pub body: Vec<u8>,
    pub created_at: DateTime<Utc>,
}

/// Write-side request: one aggregate mutation producing one or more events.
///
/// Saving a record appends `details.len()` events with versions
/// `version+1 ..= version+details.len()` atomically.
#[derive(Debug, Clone, PartialEq)]
pub struct EventRecord {
    pub aggregate_id: String,
    /// Last version known to the writer; a clash fails the save.
    pub version: u32,
    pub aggregate_type: String,
    pub idempotency_key: String,
    pub labels: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub details: Vec<EventDetail>,
}

/// One event within an [`EventRecord`].
#[derive(Debug, Clone, PartialEq)]
pub struct EventDetail {
    pub kind: String,
    pub body: Vec<u8>,
}

/// Selects the events of interest when scanning the store.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Filter {
    /// Only these aggregate types; empty means all.
    pub aggregate_types: Vec<String>,

    /// Partition count of the scheme; 0 disables partition filtering.
    pub partitions: u32,

    /// First partition of the range (inclusive, 1-based).
    pub partitions_low: u32,

    /// Last partition of the range (inclusive, 1-based).
    pub partitions_hi: u32,

    /// Label constraints: key must carry one of the listed values.
    pub labels: BTreeMap<String, Vec<String>>,
}

impl Filter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restrict to the given aggregate types.
    pub fn with_aggregate_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.aggregate_types = types.into_iter().map(Into::into).collect();
        self
    }

    /// Restrict to the partition range `low..=hi` of an `n`-partition scheme.
    pub fn with_partitions(mut self, n: u32, low: u32, hi: u32) -> Self {
        self.partitions = n;
        self.partitions_low = low;
        self.partitions_hi = hi;
        self
    }

    /// Require `key` to carry one of `values`.
    pub fn with_label<S: Into<String>>(mut self, key: S, values: Vec<String>) -> Self {
        self.labels.insert(key.into(), values);
        self
    }

    /// Whether the event passes every constraint of this filter.
    pub fn matches(&self, event: &Event) -> bool {
        if !self.aggregate_types.is_empty()
            && !self.aggregate_types.contains(&event.aggregate_type)
        {
            return false;
        }
        if self.partitions > 0 {
            let p = event.partition(self.partitions);
            if p < self.partitions_low || p > self.partitions_hi {
                return false;
            }
        }
        for (key, values) in &self.labels {
            match event.labels.get(key) {
                Some(v) if values.contains(v) => {}
                _ => return false,
            }
        }
        true
    }
}

/// Identifies the events whose bodies a Forget call rewrites.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ForgetRequest {
    pub aggregate_id: String,
    pub event_kind: String,
}

/// Base64 (de)serialization for binary bodies, keeping bus envelopes compact
/// and human-inspectable.
mod serde_bytes_b64 {
    use base64::{engine::general_purpose, Engine as _};
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(data: &[u8], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&general_purpose::STANDARD.encode(data))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let s = String::deserialize(deserializer)?;
        general_purpose::STANDARD
            .decode(s)
            .map_err(serde::de::Error::custom)
    }
}
