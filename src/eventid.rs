//! Time-sortable event identifiers
//!
//! An [`EventId`] packs `<48-bit millisecond timestamp><16-bit aggregate-hash
//! salt><32-bit aggregate version>` into the high bits of a 128-bit ULID and
//! renders it as Crockford base32: 26 characters, URL-safe, fixed width, and
//! lexicographic order equal to numeric order.
//!
//! Two events of the same aggregate always yield strictly increasing IDs:
//! within one save they share a timestamp and the version grows; across saves
//! the store bumps the timestamp past the aggregate's last update. IDs of
//! different aggregates in the same millisecond interleave arbitrarily.

use std::fmt;
use std::str::FromStr;
use std::time::Duration;

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use ulid::Ulid;

use crate::partition;

const TIMESTAMP_BITS: u32 = 48;
const SALT_BITS: u32 = 16;
const VERSION_BITS: u32 = 32;

const TIMESTAMP_SHIFT: u32 = 128 - TIMESTAMP_BITS;
const SALT_SHIFT: u32 = TIMESTAMP_SHIFT - SALT_BITS;
const VERSION_SHIFT: u32 = SALT_SHIFT - VERSION_BITS;

const TIMESTAMP_MASK: u64 = (1 << TIMESTAMP_BITS) - 1;

/// Errors raised when decoding an event ID
#[derive(Debug, Error, PartialEq, Eq)]
pub enum EventIdError {
    #[error("invalid event id: {0}")]
    Invalid(String),
}

/// Opaque, sortable identifier of a stored event.
///
/// The zero value sorts before every real ID and is used as the "from the
/// beginning" cursor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EventId(Ulid);

impl Default for EventId {
    fn default() -> Self {
        Self::zero()
    }
}

impl EventId {
    /// Compose an ID from its three components.
    ///
    /// Deterministic: the same `(now, aggregate_id, version)` triple always
    /// yields the same ID.
    pub fn new(now: DateTime<Utc>, aggregate_id: &str, version: u32) -> Self {
        let millis = (now.timestamp_millis().max(0) as u64) & TIMESTAMP_MASK;
        let salt = (partition::hash(aggregate_id) & 0xffff) as u16;
        Self::from_parts(millis, salt, version)
    }

    fn from_parts(millis: u64, salt: u16, version: u32) -> Self {
        let raw = (u128::from(millis) << TIMESTAMP_SHIFT)
            | (u128::from(salt) << SALT_SHIFT)
            | (u128::from(version) << VERSION_SHIFT);
        Self(Ulid(raw))
    }

    /// The zero ID, sorting before every real ID.
    pub fn zero() -> Self {
        Self(Ulid(0))
    }

    /// Whether this is the zero ID.
    pub fn is_zero(&self) -> bool {
        self.0 .0 == 0
    }

    /// Decode the canonical 26-character base32 form.
    pub fn parse(s: &str) -> Result<Self, EventIdError> {
        let ulid = Ulid::from_string(s).map_err(|e| EventIdError::Invalid(e.to_string()))?;
        Ok(Self(ulid))
    }

    /// Millisecond timestamp component.
    pub fn timestamp(&self) -> DateTime<Utc> {
        let millis = (self.0 .0 >> TIMESTAMP_SHIFT) as i64;
        Utc.timestamp_millis_opt(millis).unwrap()
    }

    /// Aggregate-ID hash salt component (low 16 bits of the FNV-1a hash).
    pub fn salt(&self) -> u16 {
        ((self.0 .0 >> SALT_SHIFT) & 0xffff) as u16
    }

    /// Aggregate version component.
    pub fn version(&self) -> u32 {
        ((self.0 .0 >> VERSION_SHIFT) & 0xffff_ffff) as u32
    }

    /// Subtract `lag` from the timestamp component, yielding a valid lower
    /// bound for re-reading events around write-visibility skew.
    ///
    /// The salt and version components are preserved; the timestamp
    /// saturates at zero.
    pub fn delay(&self, lag: Duration) -> Self {
        if self.is_zero() {
            return *self;
        }
        let millis = (self.0 .0 >> TIMESTAMP_SHIFT) as u64;
        let delayed = millis.saturating_sub(lag.as_millis() as u64);
        Self::from_parts(delayed, self.salt(), self.version())
    }
}

impl fmt::Display for EventId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for EventId {
    type Err = EventIdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl From<EventId> for u128 {
    fn from(id: EventId) -> Self {
        id.0 .0
    }
}

impl From<u128> for EventId {
    fn from(raw: u128) -> Self {
        Self(Ulid(raw))
    }
}
