//! Exponential backoff with jitter.
//!
//! `delay = min(base * multiplier^attempt, cap) ± jitter_fraction`

use std::time::Duration;

use rand::Rng;

/// Backoff schedule used by the transport recovery task.
#[derive(Debug, Clone, PartialEq)]
pub struct BackoffPolicy {
    /// Delay before the first retry
    pub base: Duration,
    /// Upper bound before jitter is applied
    pub cap: Duration,
    /// Growth factor per attempt (2.0 = doubling)
    pub multiplier: f64,
    /// Random jitter as fraction of delay (0.1 = ±10%)
    pub jitter_fraction: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            base: Duration::from_secs(1),
            cap: Duration::from_secs(60),
            multiplier: 2.0,
            jitter_fraction: 0.1,
        }
    }
}

impl BackoffPolicy {
    pub fn new(base: Duration, cap: Duration) -> Self {
        Self {
            base,
            cap,
            ..Default::default()
        }
    }

    /// Delay before the capped value is jittered.
    pub fn nominal_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.min(63) as i32;
        let base_ms = self.base.as_millis() as f64 * self.multiplier.powi(exponent);
        let capped_ms = base_ms.min(self.cap.as_millis() as f64);
        Duration::from_millis(capped_ms.max(0.0) as u64)
    }

    /// Calculate backoff delay with jitter for the given attempt number.
    pub fn delay(&self, attempt: u32) -> Duration {
        let capped = self.nominal_delay(attempt).as_millis() as f64;
        let jitter_range = capped * self.jitter_fraction;
        let jitter = if jitter_range > 0.0 {
            rand::rng().random_range(-jitter_range..=jitter_range)
        } else {
            0.0
        };
        Duration::from_millis((capped + jitter).max(0.0) as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_nominal_delay_doubles_and_caps() {
        let policy = BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(10));
        assert_eq!(policy.nominal_delay(0), Duration::from_secs(1));
        assert_eq!(policy.nominal_delay(1), Duration::from_secs(2));
        assert_eq!(policy.nominal_delay(3), Duration::from_secs(8));
        assert_eq!(policy.nominal_delay(4), Duration::from_secs(10));
        assert_eq!(policy.nominal_delay(40), Duration::from_secs(10));
    }

    #[test]
    fn test_jitter_stays_within_ten_percent() {
        let policy = BackoffPolicy::new(Duration::from_secs(1), Duration::from_secs(60));
        for attempt in 0..8 {
            let nominal = policy.nominal_delay(attempt).as_millis() as f64;
            for _ in 0..20 {
                let d = policy.delay(attempt).as_millis() as f64;
                assert!(d >= nominal * 0.9 - 1.0, "{} below range of {}", d, nominal);
                assert!(d <= nominal * 1.1 + 1.0, "{} above range of {}", d, nominal);
            }
        }
    }
}
