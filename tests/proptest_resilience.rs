//! Property-based tests for the message envelope and the resilience
//! primitives.
//!
//! These tests use proptest to verify invariants across many random inputs,
//! catching edge cases that unit tests might miss.

use proptest::prelude::*;
use serde_json::{Map, Value};
use std::time::Duration;

use tradeguard::resilience::{
    BackoffPolicy, BreakerSettings, CircuitBreaker, CircuitState, HysteresisDecision,
    HysteresisEvaluator, NOfMRule,
};
use tradeguard::transport::{compute_checksum, TransportMessage};

fn payload(fields: &[(String, i64)]) -> Value {
    let mut map = Map::new();
    for (k, v) in fields {
        map.insert(k.clone(), Value::from(*v));
    }
    Value::Object(map)
}

fn fields() -> impl Strategy<Value = Vec<(String, i64)>> {
    prop::collection::vec(("[a-z]{1,8}", any::<i64>()), 0..12)
}

proptest! {
    /// Encoded messages decode to the same envelope and still verify
    #[test]
    fn checksum_survives_encode_decode(fields in fields(), priority in -10i32..10) {
        let msg = TransportMessage::new("order", payload(&fields)).with_priority(priority);
        let bytes = msg.encode().unwrap();
        let decoded = TransportMessage::decode_verified(&bytes).unwrap();
        prop_assert!(decoded.validate_checksum());
        prop_assert_eq!(decoded, msg);
    }

    /// Any change to the payload invalidates the stored checksum
    #[test]
    fn altered_payload_fails_verification(fields in fields(), extra in any::<i64>()) {
        let mut msg = TransportMessage::new("order", payload(&fields));
        if let Value::Object(map) = &mut msg.payload {
            map.insert("__altered".to_string(), Value::from(extra));
        }
        prop_assert!(!msg.validate_checksum());
        let bytes = msg.encode().unwrap();
        prop_assert!(TransportMessage::decode_verified(&bytes).is_err());
    }

    /// Key insertion order never changes the checksum
    #[test]
    fn checksum_ignores_key_order(fields in fields()) {
        // Later duplicates win on insert, so dedupe before comparing
        let mut seen = std::collections::BTreeMap::new();
        for (k, v) in &fields {
            seen.insert(k.clone(), *v);
        }
        let forward: Vec<(String, i64)> = seen.clone().into_iter().collect();
        let backward: Vec<(String, i64)> = seen.into_iter().rev().collect();
        prop_assert_eq!(
            compute_checksum(&payload(&forward)),
            compute_checksum(&payload(&backward))
        );
    }

    /// Fewer than three samples never move a status
    #[test]
    fn n_of_m_needs_three_samples(
        outcomes in prop::collection::vec(any::<bool>(), 1..3),
        promote_n in 1usize..3,
        demote_n in 1usize..3,
    ) {
        let promote = NOfMRule::new(promote_n, 3).unwrap();
        let demote = NOfMRule::new(demote_n, 3).unwrap();
        let mut evaluator = HysteresisEvaluator::new(10, 0.1);
        for ok in outcomes {
            prop_assert_eq!(
                evaluator.evaluate_n_of_m(ok, promote, demote),
                HysteresisDecision::NoChange
            );
        }
    }

    /// An all-failure window always promotes once it is long enough
    #[test]
    fn sustained_failures_promote(n in 1usize..5, extra in 0usize..5) {
        let m = n + extra;
        let promote = NOfMRule::new(n, m).unwrap();
        let demote = NOfMRule::new(1, m).unwrap();
        let mut evaluator = HysteresisEvaluator::new(m.max(3), 0.1);
        let mut last = HysteresisDecision::NoChange;
        for _ in 0..m.max(3) {
            last = evaluator.evaluate_n_of_m(false, promote, demote);
        }
        prop_assert_eq!(last, HysteresisDecision::Promote);
    }

    /// Jittered delays stay within the configured band around the capped value
    #[test]
    fn backoff_delay_is_bounded(base_ms in 1u64..5_000, cap_ms in 1u64..120_000, attempt in 0u32..80) {
        let policy = BackoffPolicy::new(Duration::from_millis(base_ms), Duration::from_millis(cap_ms));
        let nominal = policy.nominal_delay(attempt).as_millis() as f64;
        prop_assert!(nominal <= cap_ms as f64);
        let delay = policy.delay(attempt).as_millis() as f64;
        prop_assert!(delay <= nominal * (1.0 + policy.jitter_fraction) + 1.0);
        prop_assert!(delay >= nominal * (1.0 - policy.jitter_fraction) - 1.0);
    }

    /// The breaker opens on exactly the threshold-th consecutive failure
    #[test]
    fn breaker_trips_at_threshold(threshold in 1u32..10) {
        let breaker = CircuitBreaker::new(
            "prop",
            BreakerSettings {
                failure_threshold: threshold,
                recovery_timeout: Duration::from_secs(60),
                half_open_probe_count: 1,
            },
        );
        for _ in 1..threshold {
            breaker.record_failure();
            prop_assert_eq!(breaker.get_state(), CircuitState::Closed);
        }
        breaker.record_failure();
        prop_assert_eq!(breaker.get_state(), CircuitState::Open);
        prop_assert!(breaker.try_acquire().is_err());
    }
}
