//! Partition assignment properties.

use proptest::prelude::*;

use eventline::partition;

proptest! {
    #[test]
    fn assignment_is_stable_and_in_range(
        aggregate_id in "[a-zA-Z0-9_/-]{1,64}",
        partitions in 1u32..=256,
    ) {
        let p = partition::which_partition(&aggregate_id, partitions);

        prop_assert!((1..=partitions).contains(&p));
        // Deterministic: the same ID always lands on the same partition.
        prop_assert_eq!(p, partition::which_partition(&aggregate_id, partitions));
        // And it equals the documented formula over the persisted hash.
        prop_assert_eq!(p, (partition::hash(&aggregate_id) % partitions) + 1);
    }

    #[test]
    fn disabled_partitioning_maps_everything_to_all(
        aggregate_id in "[a-zA-Z0-9_/-]{1,64}",
    ) {
        prop_assert_eq!(
            partition::which_partition(&aggregate_id, 0),
            partition::ALL_PARTITION
        );
    }
}
