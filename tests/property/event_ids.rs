//! Event ID properties: round-trips and ordering.

use std::time::Duration;

use chrono::{TimeZone, Utc};
use proptest::prelude::*;

use eventline::eventid::EventId;
use eventline::partition;

// 48 bits of milliseconds; stay inside the representable range.
const MAX_MILLIS: i64 = (1 << 47) - 1;

fn arb_millis() -> impl Strategy<Value = i64> {
    0..MAX_MILLIS
}

fn arb_aggregate_id() -> impl Strategy<Value = String> {
    "[a-z0-9-]{1,32}"
}

proptest! {
    #[test]
    fn parse_recovers_all_components(
        millis in arb_millis(),
        aggregate_id in arb_aggregate_id(),
        version in 1u32..,
    ) {
        let now = Utc.timestamp_millis_opt(millis).unwrap();
        let id = EventId::new(now, &aggregate_id, version);

        prop_assert_eq!(id.timestamp(), now);
        prop_assert_eq!(id.salt(), (partition::hash(&aggregate_id) & 0xffff) as u16);
        prop_assert_eq!(id.version(), version);
    }

    #[test]
    fn string_form_roundtrips(
        millis in arb_millis(),
        aggregate_id in arb_aggregate_id(),
        version in 1u32..,
    ) {
        let id = EventId::new(Utc.timestamp_millis_opt(millis).unwrap(), &aggregate_id, version);
        let encoded = id.to_string();

        prop_assert_eq!(encoded.len(), 26);
        prop_assert_eq!(EventId::parse(&encoded).unwrap(), id);
    }

    #[test]
    fn compare_agrees_with_time_version_lexicographic(
        t1 in arb_millis(),
        t2 in arb_millis(),
        aggregate_id in arb_aggregate_id(),
        v1 in 1u32..,
        v2 in 1u32..,
    ) {
        let a = EventId::new(Utc.timestamp_millis_opt(t1).unwrap(), &aggregate_id, v1);
        let b = EventId::new(Utc.timestamp_millis_opt(t2).unwrap(), &aggregate_id, v2);

        prop_assert_eq!(a.cmp(&b), (t1, v1).cmp(&(t2, v2)));
        // Lexicographic comparison of the encoded form agrees too.
        prop_assert_eq!(a.to_string().cmp(&b.to_string()), (t1, v1).cmp(&(t2, v2)));
    }

    #[test]
    fn delay_yields_a_lower_bound(
        millis in arb_millis(),
        aggregate_id in arb_aggregate_id(),
        version in 1u32..,
        lag_ms in 0u64..100_000,
    ) {
        let id = EventId::new(Utc.timestamp_millis_opt(millis).unwrap(), &aggregate_id, version);
        let delayed = id.delay(Duration::from_millis(lag_ms));

        prop_assert!(delayed <= id);
        prop_assert_eq!(delayed.version(), id.version());
        prop_assert_eq!(delayed.salt(), id.salt());
    }

    #[test]
    fn same_millisecond_orders_by_version(
        millis in arb_millis(),
        aggregate_id in arb_aggregate_id(),
        version in 1u32..u32::MAX,
    ) {
        let now = Utc.timestamp_millis_opt(millis).unwrap();
        let a = EventId::new(now, &aggregate_id, version);
        let b = EventId::new(now, &aggregate_id, version + 1);
        prop_assert!(a < b);
    }
}
