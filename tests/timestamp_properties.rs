//! Property tests for timestamp arithmetic and ordering

use calcgraph::{Timestamp, TimestampDiff};
use proptest::prelude::*;

fn range_value() -> impl Strategy<Value = i64> {
    (i64::MIN + 3)..=(i64::MAX - 3)
}

proptest! {
    #[test]
    fn prop_range_values_are_accepted(v in range_value()) {
        let ts = Timestamp::new(v).unwrap();
        prop_assert!(ts.is_range_value());
        prop_assert!(ts.is_allowed_in_stream());
        prop_assert_eq!(ts.value(), v);
    }

    #[test]
    fn prop_next_allowed_is_strictly_later(v in range_value()) {
        let ts = Timestamp::new(v).unwrap();
        let next = ts.next_allowed_in_stream().unwrap();
        prop_assert!(next > ts);
        if ts < Timestamp::MAX {
            prop_assert_eq!(next.value(), v + 1);
            prop_assert_eq!(next.previous_allowed_in_stream(), ts);
        } else {
            prop_assert_eq!(next, Timestamp::ONE_OVER_POST_STREAM);
        }
    }

    #[test]
    fn prop_addition_clamps_to_range(v in range_value(), d in any::<i64>()) {
        let sum = Timestamp::new(v).unwrap().checked_add(TimestampDiff::new(d)).unwrap();
        prop_assert!(sum.is_range_value());
        let exact = v as i128 + d as i128;
        if exact > Timestamp::MAX.value() as i128 {
            prop_assert_eq!(sum, Timestamp::MAX);
        } else if exact < Timestamp::MIN.value() as i128 {
            prop_assert_eq!(sum, Timestamp::MIN);
        } else {
            prop_assert_eq!(sum.value() as i128, exact);
        }
    }

    #[test]
    fn prop_diff_inverts_addition(a in -1_000_000_000i64..1_000_000_000, d in -1_000_000i64..1_000_000) {
        let start = Timestamp::new(a).unwrap();
        let end = start.checked_add(TimestampDiff::new(d)).unwrap();
        prop_assert_eq!(end.checked_diff(start).unwrap(), TimestampDiff::new(d));
        prop_assert_eq!(end.checked_sub(TimestampDiff::new(d)).unwrap(), start);
    }

    #[test]
    fn prop_order_matches_raw_values(a in range_value(), b in range_value()) {
        let (ta, tb) = (Timestamp::new(a).unwrap(), Timestamp::new(b).unwrap());
        prop_assert_eq!(ta.cmp(&tb), a.cmp(&b));
    }
}

#[test]
fn test_sentinels_are_ordered() {
    let order = [
        Timestamp::UNSET,
        Timestamp::UNSTARTED,
        Timestamp::PRE_STREAM,
        Timestamp::MIN,
        Timestamp::MAX,
        Timestamp::POST_STREAM,
        Timestamp::ONE_OVER_POST_STREAM,
        Timestamp::DONE,
    ];
    assert!(order.windows(2).all(|w| w[0] < w[1]));
    for special in [Timestamp::UNSET, Timestamp::UNSTARTED, Timestamp::DONE] {
        assert!(Timestamp::new(special.value()).is_err());
        assert!(!special.is_allowed_in_stream());
        assert!(special.checked_add(TimestampDiff::new(1)).is_err());
    }
    assert!(Timestamp::PRE_STREAM.is_allowed_in_stream());
    assert!(Timestamp::POST_STREAM.is_allowed_in_stream());
    assert_eq!(
        Timestamp::PRE_STREAM.next_allowed_in_stream().unwrap(),
        Timestamp::ONE_OVER_POST_STREAM
    );
    assert!(Timestamp::POST_STREAM.next_allowed_in_stream().is_err());
}
