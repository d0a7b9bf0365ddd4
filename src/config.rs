//! Runtime configuration
//!
//! Plain options struct with defaults; wiring it from flags or files is the
//! host application's concern.

use std::time::Duration;

use crate::partition::{parse_slots, PartitionError, PartitionSlot};

/// Recognized options and their defaults.
#[derive(Debug, Clone)]
pub struct Config {
    /// Write a snapshot when events since the last one reach this count.
    pub snapshot_threshold: u32,

    /// Safety window subtracted from `now` when polling the store.
    pub trailing_lag: Duration,

    /// Maximum events fetched per poll scan.
    pub poll_batch_size: usize,

    /// Sleep between poll scans once the store is drained.
    pub poll_interval: Duration,

    /// Partition count of the scheme; 0 disables partitioning.
    pub partitions: u32,

    /// This process's eligible worker ranges, e.g. `"1-6,7-12"`.
    pub partition_slots: String,

    /// Lease duration of distributed locks; refresh runs at `ttl/2`.
    pub lock_ttl: Duration,

    /// Balancer tick.
    pub heartbeat: Duration,

    /// How long a worker stop waits before declaring the task hung.
    pub stop_grace: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            snapshot_threshold: 100,
            trailing_lag: Duration::from_millis(250),
            poll_batch_size: 100,
            poll_interval: Duration::from_millis(500),
            partitions: 0,
            partition_slots: String::new(),
            lock_ttl: Duration::from_secs(10),
            heartbeat: Duration::from_secs(5),
            stop_grace: Duration::from_secs(5),
        }
    }
}

impl Config {
    /// Lock refresh cadence, half the lease duration.
    pub fn lock_refresh_interval(&self) -> Duration {
        self.lock_ttl / 2
    }

    /// Parsed partition ranges this process may own. With partitioning
    /// disabled (or no declaration) a single whole-stream slot is returned.
    pub fn slots(&self) -> Result<Vec<PartitionSlot>, PartitionError> {
        if self.partitions == 0 || self.partition_slots.is_empty() {
            return Ok(vec![PartitionSlot::all()]);
        }
        parse_slots(&self.partition_slots, self.partitions)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.snapshot_threshold, 100);
        assert_eq!(config.trailing_lag, Duration::from_millis(250));
        assert_eq!(config.poll_batch_size, 100);
        assert_eq!(config.poll_interval, Duration::from_millis(500));
        assert_eq!(config.partitions, 0);
        assert_eq!(config.heartbeat, Duration::from_secs(5));
        assert_eq!(config.stop_grace, Duration::from_secs(5));
    }

    #[test]
    fn test_refresh_interval_is_half_the_ttl() {
        let config = Config {
            lock_ttl: Duration::from_secs(8),
            ..Config::default()
        };
        assert_eq!(config.lock_refresh_interval(), Duration::from_secs(4));
    }

    #[test]
    fn test_slots_disabled_partitioning_yields_whole_stream() {
        let config = Config::default();
        assert_eq!(config.slots().unwrap(), vec![PartitionSlot::all()]);
    }

    #[test]
    fn test_slots_parse_declared_ranges() {
        let config = Config {
            partitions: 12,
            partition_slots: "1-6,7-12".to_string(),
            ..Config::default()
        };
        let slots = config.slots().unwrap();
        assert_eq!(slots.len(), 2);
        assert_eq!(slots[0], PartitionSlot { from: 1, to: 6 });
        assert_eq!(slots[1], PartitionSlot { from: 7, to: 12 });
    }
}
