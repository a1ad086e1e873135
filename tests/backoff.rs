use std::time::Duration;

use fieldsync_lib::{FailureKind, MutationStatus, RetryPolicy};
use proptest::prelude::*;

fn policy(base_ms: u64, max_ms: u64) -> RetryPolicy {
    RetryPolicy::new(5, Duration::from_millis(base_ms), Duration::from_millis(max_ms))
}

proptest! {
    #[test]
    fn delay_grows_until_the_cap(base in 1u64..10_000, extra in 0u64..1_000_000, attempt in 1u32..64) {
        let p = policy(base, base + extra);
        let here = p.base_delay_for(attempt);
        let next = p.base_delay_for(attempt + 1);
        prop_assert!(here <= next);
        prop_assert!(next <= p.max_delay);
        prop_assert!(here >= p.base_delay.min(p.max_delay));
    }

    #[test]
    fn jitter_stays_within_ratio(base in 1u64..10_000, attempt in 1u32..10) {
        let p = policy(base, 300_000);
        let floor = p.base_delay_for(attempt);
        let spread = Duration::from_millis((floor.as_millis() as f64 * p.jitter_ratio) as u64);
        let delay = p.delay_for(attempt);
        prop_assert!(delay >= floor);
        prop_assert!(delay <= floor + spread);
    }

    #[test]
    fn exhausted_failures_are_never_automatic(retries in 0u32..20, now in 0i64..i64::MAX / 2) {
        let p = policy(2_000, 300_000);
        let allowed = p.allows(MutationStatus::Failed, Some(FailureKind::Transient), retries, Some(0), now);
        prop_assert_eq!(allowed, retries < p.max_retries);
    }
}

#[test]
fn first_attempts_follow_the_doubling_schedule() {
    let p = policy(2_000, 300_000);
    let secs: Vec<u64> = (1..=9).map(|n| p.base_delay_for(n).as_secs()).collect();
    assert_eq!(secs, vec![2, 4, 8, 16, 32, 64, 128, 256, 300]);
}

#[test]
fn permanent_and_in_flight_records_are_not_eligible() {
    let p = policy(2_000, 300_000);
    assert!(p.allows(MutationStatus::Pending, None, 9, None, 0));
    assert!(!p.allows(MutationStatus::Syncing, None, 0, None, 0));
    assert!(!p.allows(
        MutationStatus::Failed,
        Some(FailureKind::Permanent),
        0,
        None,
        0
    ));
    assert!(!p.allows(
        MutationStatus::Failed,
        Some(FailureKind::Transient),
        1,
        Some(10_000),
        5_000
    ));
}
