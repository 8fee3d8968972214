//! Property tests for retry delays.

use std::time::Duration;

use proptest::prelude::*;
use ws_resilient_client::BackoffPolicy;

fn policy() -> impl Strategy<Value = BackoffPolicy> {
    (1u64..5_000, 0u64..120_000, 1u32..=4).prop_map(|(base_ms, extra_ms, multiplier)| {
        BackoffPolicy {
            base: Duration::from_millis(base_ms),
            max: Duration::from_millis(base_ms + extra_ms),
            multiplier: f64::from(multiplier),
            jitter: false,
        }
    })
}

proptest! {
    #[test]
    fn delay_is_non_decreasing(policy in policy(), attempt in 0u32..100) {
        prop_assert!(policy.next_delay(attempt) <= policy.next_delay(attempt + 1));
    }

    #[test]
    fn delay_never_exceeds_max(policy in policy(), attempt in any::<u32>()) {
        prop_assert!(policy.next_delay(attempt) <= policy.max);
    }

    #[test]
    fn first_delay_is_base(policy in policy()) {
        let first = policy.next_delay(0);
        prop_assert!(first <= policy.base);
        prop_assert!(policy.base - first <= Duration::from_nanos(1));
    }

    #[test]
    fn delay_is_deterministic(policy in policy(), attempt in 0u32..100) {
        prop_assert_eq!(policy.next_delay(attempt), policy.next_delay(attempt));
    }

    #[test]
    fn jitter_stays_within_bounds(policy in policy(), attempt in 0u32..100) {
        let capped = policy.next_delay(attempt);
        let jittered = policy.clone().with_jitter(true).next_delay(attempt);
        prop_assert!(jittered <= capped);
        prop_assert!(jittered <= policy.max);
        prop_assert!(jittered + Duration::from_nanos(1) >= capped / 2);
    }
}
