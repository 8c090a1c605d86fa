//! Rate-limited logging utilities.
//!
//! Provides `LogThrottle` to prevent log storms while still tracking suppressed messages.

use std::time::Duration;
use tokio::time::Instant;

/// A lightweight rate limiter for logging to prevent log storms.
#[derive(Debug)]
pub struct LogThrottle {
    last_log_time: Option<Instant>,
    suppressed_count: u64,
    interval: Duration,
}

impl LogThrottle {
    pub fn new(interval: Duration) -> Self {
        Self {
            last_log_time: None,
            suppressed_count: 0,
            interval,
        }
    }

    /// Returns true if the interval has passed since the last emitted log,
    /// otherwise counts the message as suppressed.
    pub fn should_log(&mut self) -> bool {
        let now = Instant::now();
        match self.last_log_time {
            Some(last) if now.duration_since(last) < self.interval => {
                self.suppressed_count += 1;
                false
            }
            _ => {
                self.last_log_time = Some(now);
                true
            }
        }
    }

    /// Returns the number of suppressed logs since the last emitted one, and resets the counter.
    pub fn get_and_reset_suppressed_count(&mut self) -> u64 {
        std::mem::take(&mut self.suppressed_count)
    }
}

/// Throttlers for the repetitive failure paths of the transport router.
#[derive(Debug)]
pub struct RouterLogThrottler {
    pub send_failure: LogThrottle,
    pub replay_failure: LogThrottle,
    pub recovery_attempt: LogThrottle,
}

impl RouterLogThrottler {
    pub fn new(interval: Duration) -> Self {
        Self {
            send_failure: LogThrottle::new(interval),
            replay_failure: LogThrottle::new(interval),
            recovery_attempt: LogThrottle::new(interval),
        }
    }
}

impl Default for RouterLogThrottler {
    fn default() -> Self {
        Self::new(Duration::from_secs(30))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(start_paused = true)]
    async fn test_suppresses_within_interval() {
        let mut throttle = LogThrottle::new(Duration::from_secs(10));
        assert!(throttle.should_log());
        assert!(!throttle.should_log());
        assert!(!throttle.should_log());

        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(throttle.should_log());
        assert_eq!(throttle.get_and_reset_suppressed_count(), 2);
        assert_eq!(throttle.get_and_reset_suppressed_count(), 0);
    }
}
