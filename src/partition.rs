//! Stream partitioning by aggregate ID
//!
//! Every event is assigned to a partition derived from a stable hash of its
//! aggregate ID. The hash is persisted on the event row at write time so that
//! feeders can filter server-side without re-hashing.

use thiserror::Error;

/// Partition number meaning "partitioning disabled": every event belongs to
/// this single pseudo-partition.
pub const ALL_PARTITION: u32 = 0;

/// Errors raised while parsing partition slot declarations
#[derive(Debug, Error, PartialEq, Eq)]
pub enum PartitionError {
    #[error("invalid partition slot '{0}'")]
    InvalidSlot(String),

    #[error("partition slot '{0}-{1}' is reversed")]
    ReversedSlot(u32, u32),

    #[error("partition {0} is outside 1..={1}")]
    OutOfRange(u32, u32),
}

/// Stable 32-bit FNV-1a hash of an aggregate ID.
///
/// Hand-rolled so the value never changes across toolchains or crate
/// upgrades: this hash is persisted on every event row.
pub fn hash(aggregate_id: &str) -> u32 {
    const OFFSET_BASIS: u32 = 0x811c9dc5;
    const PRIME: u32 = 0x01000193;
    aggregate_id.bytes().fold(OFFSET_BASIS, |acc, byte| {
        (acc ^ u32::from(byte)).wrapping_mul(PRIME)
    })
}

/// Map a persisted aggregate-ID hash to a partition in `1..=partitions`.
///
/// With `partitions == 0` partitioning is disabled and [`ALL_PARTITION`]
/// is returned.
pub fn partition_of(aggregate_id_hash: u32, partitions: u32) -> u32 {
    if partitions == 0 {
        return ALL_PARTITION;
    }
    (aggregate_id_hash % partitions) + 1
}

/// Convenience: partition for an aggregate ID directly.
pub fn which_partition(aggregate_id: &str, partitions: u32) -> u32 {
    partition_of(hash(aggregate_id), partitions)
}

/// An inclusive range of partitions owned by one worker.
///
/// `[0, 0]` means "no partitioning": the worker consumes the whole stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PartitionSlot {
    pub from: u32,
    pub to: u32,
}

impl PartitionSlot {
    /// The whole-stream slot used when partitioning is disabled.
    pub fn all() -> Self {
        Self { from: 0, to: 0 }
    }

    /// Number of partitions covered by this slot.
    pub fn size(&self) -> u32 {
        self.to - self.from + 1
    }

    /// Whether the given partition number falls inside this slot.
    pub fn contains(&self, partition: u32) -> bool {
        (self.from..=self.to).contains(&partition)
    }

    /// Worker-name suffix for this slot, e.g. `"7-12"`.
    pub fn label(&self) -> String {
        format!("{}-{}", self.from, self.to)
    }
}

/// Parse a slot declaration like `"1-6,7-12"` into partition ranges.
///
/// Single partitions may be written without a dash (`"3"` is `[3, 3]`).
/// Every partition must fall inside `1..=partitions`.
pub fn parse_slots(input: &str, partitions: u32) -> Result<Vec<PartitionSlot>, PartitionError> {
    let mut slots = Vec::new();
    for part in input.split(',') {
        let part = part.trim();
        let slot = match part.split_once('-') {
            Some((lo, hi)) => {
                let from = lo
                    .trim()
                    .parse::<u32>()
                    .map_err(|_| PartitionError::InvalidSlot(part.to_string()))?;
                let to = hi
                    .trim()
                    .parse::<u32>()
                    .map_err(|_| PartitionError::InvalidSlot(part.to_string()))?;
                if from > to {
                    return Err(PartitionError::ReversedSlot(from, to));
                }
                PartitionSlot { from, to }
            }
            None => {
                let p = part
                    .parse::<u32>()
                    .map_err(|_| PartitionError::InvalidSlot(part.to_string()))?;
                PartitionSlot { from: p, to: p }
            }
        };
        for bound in [slot.from, slot.to] {
            if bound == 0 || bound > partitions {
                return Err(PartitionError::OutOfRange(bound, partitions));
            }
        }
        slots.push(slot);
    }
    Ok(slots)
}
