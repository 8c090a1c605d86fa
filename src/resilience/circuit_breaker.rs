//! # Circuit Breaker Pattern
//!
//! The Circuit Breaker pattern prevents cascading failures by temporarily blocking
//! calls to a failing resource, allowing it time to recover.
//!
//! ## States
//! - **Closed**: Normal operation, calls pass through. A success decays the
//!   failure count by one so transient noise can self-heal.
//! - **Open**: Calls fail fast after `failure_threshold` failures.
//! - **HalfOpen**: After `recovery_timeout`, calls are let through as probes,
//!   at most `half_open_probe_count` at a time. That many successes close the
//!   breaker; any failure re-opens it.
//!
//! ## Usage
//! ```ignore
//! let breaker = CircuitBreaker::new("socket", BreakerSettings::default());
//!
//! match breaker.call(|| transport.send(&msg)).await {
//!     Ok(()) => {}
//!     Err(BreakerError::Open { .. }) => { /* fast fail, nothing was called */ }
//!     Err(BreakerError::Inner(e)) => { /* counted as a failure */ }
//! }
//! ```
//!
//! Time is read from `tokio::time::Instant` so tests can drive the recovery
//! window with a paused clock.

use std::future::Future;
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::time::Instant;
use tracing::{info, warn};

use crate::metrics;

/// State of the circuit breaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    /// Normal operation - calls pass through
    Closed,
    /// Failing fast due to recent failures
    Open,
    /// Probing whether the resource recovered
    HalfOpen,
}

impl CircuitState {
    /// Gauge encoding used by the metrics module.
    pub fn as_gauge(self) -> f64 {
        match self {
            CircuitState::Closed => 0.0,
            CircuitState::HalfOpen => 1.0,
            CircuitState::Open => 2.0,
        }
    }
}

impl std::fmt::Display for CircuitState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            CircuitState::Closed => write!(f, "closed"),
            CircuitState::Open => write!(f, "open"),
            CircuitState::HalfOpen => write!(f, "half_open"),
        }
    }
}

/// Tuning for a single breaker.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BreakerSettings {
    /// Failures that trip the breaker while closed.
    pub failure_threshold: u32,
    /// Time since the last failure before an open breaker admits a probe.
    pub recovery_timeout: Duration,
    /// Successful probes required to close a half-open breaker.
    pub half_open_probe_count: u32,
}

impl Default for BreakerSettings {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            recovery_timeout: Duration::from_secs(60),
            half_open_probe_count: 3,
        }
    }
}

/// Error returned by [`CircuitBreaker::call`].
#[derive(Error, Debug)]
pub enum BreakerError<E> {
    /// The breaker is open; the wrapped function was not invoked.
    #[error("circuit open for {resource}")]
    Open { resource: String },
    /// The wrapped function ran and failed.
    #[error(transparent)]
    Inner(E),
}

impl<E> BreakerError<E> {
    pub fn is_open(&self) -> bool {
        matches!(self, BreakerError::Open { .. })
    }
}

/// Rejection returned by [`CircuitBreaker::try_acquire`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("circuit open for {resource}")]
pub struct CircuitOpen {
    pub resource: String,
}

/// Snapshot of a breaker's internal counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CircuitBreakerState {
    pub state: CircuitState,
    pub failure_count: u32,
    pub probe_count: u32,
    /// Probes admitted in HalfOpen whose outcome is not yet recorded
    pub in_flight: u32,
    pub last_failure_time: Option<Instant>,
}

/// Per-resource circuit breaker.
///
/// One instance guards one health check or one transport. The counters live
/// behind the breaker's own mutex, which is never held across an `.await`.
pub struct CircuitBreaker {
    name: String,
    settings: BreakerSettings,
    inner: Mutex<CircuitBreakerState>,
}

impl CircuitBreaker {
    /// Creates a closed breaker for the named resource.
    pub fn new(name: impl Into<String>, settings: BreakerSettings) -> Self {
        let name = name.into();
        metrics::set_breaker_state(&name, CircuitState::Closed);
        Self {
            name,
            settings,
            inner: Mutex::new(CircuitBreakerState {
                state: CircuitState::Closed,
                failure_count: 0,
                probe_count: 0,
                in_flight: 0,
                last_failure_time: None,
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn settings(&self) -> BreakerSettings {
        self.settings
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, CircuitBreakerState> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Returns a copy of the breaker counters.
    pub fn snapshot(&self) -> CircuitBreakerState {
        *self.lock()
    }

    /// Returns the current state without attempting an Open -> HalfOpen move.
    pub fn get_state(&self) -> CircuitState {
        self.lock().state
    }

    pub fn get_failure_count(&self) -> u32 {
        self.lock().failure_count
    }

    /// Returns `true` if a call issued now would be rejected.
    pub fn is_open(&self) -> bool {
        let guard = self.lock();
        guard.state == CircuitState::Open && !self.recovery_elapsed(&guard)
    }

    fn recovery_elapsed(&self, state: &CircuitBreakerState) -> bool {
        match state.last_failure_time {
            Some(at) => Instant::now().saturating_duration_since(at) >= self.settings.recovery_timeout,
            None => true,
        }
    }

    /// Admission check performed before every wrapped call.
    ///
    /// An open breaker whose recovery timeout has elapsed moves to HalfOpen
    /// and admits the caller as a probe. A half-open breaker rejects callers
    /// once `half_open_probe_count` probes are outstanding. Every admitted
    /// caller must report back through `record_success` or `record_failure`.
    pub fn try_acquire(&self) -> Result<(), CircuitOpen> {
        let mut guard = self.lock();
        match guard.state {
            CircuitState::Closed => Ok(()),
            CircuitState::HalfOpen => {
                if guard.in_flight >= self.settings.half_open_probe_count {
                    return Err(CircuitOpen {
                        resource: self.name.clone(),
                    });
                }
                guard.in_flight += 1;
                Ok(())
            }
            CircuitState::Open => {
                if self.recovery_elapsed(&guard) {
                    guard.state = CircuitState::HalfOpen;
                    guard.probe_count = 0;
                    guard.in_flight = 1;
                    metrics::set_breaker_state(&self.name, CircuitState::HalfOpen);
                    info!(breaker = %self.name, "Circuit breaker HALF_OPEN, admitting probe");
                    Ok(())
                } else {
                    Err(CircuitOpen {
                        resource: self.name.clone(),
                    })
                }
            }
        }
    }

    /// Records a successful call.
    pub fn record_success(&self) {
        let mut guard = self.lock();
        match guard.state {
            CircuitState::Closed => {
                guard.failure_count = guard.failure_count.saturating_sub(1);
            }
            CircuitState::HalfOpen => {
                guard.in_flight = guard.in_flight.saturating_sub(1);
                guard.probe_count += 1;
                if guard.probe_count >= self.settings.half_open_probe_count {
                    guard.state = CircuitState::Closed;
                    guard.failure_count = 0;
                    guard.probe_count = 0;
                    guard.in_flight = 0;
                    metrics::set_breaker_state(&self.name, CircuitState::Closed);
                    info!(breaker = %self.name, "Circuit breaker CLOSED after successful probes");
                }
            }
            // A call admitted before another caller tripped the breaker.
            CircuitState::Open => {}
        }
    }

    /// Records a failed call, tripping the breaker when warranted.
    pub fn record_failure(&self) {
        let mut guard = self.lock();
        guard.failure_count = guard.failure_count.saturating_add(1);
        guard.last_failure_time = Some(Instant::now());

        let trip = match guard.state {
            CircuitState::HalfOpen => true,
            CircuitState::Closed => guard.failure_count >= self.settings.failure_threshold,
            CircuitState::Open => false,
        };

        if trip {
            let from = guard.state;
            guard.state = CircuitState::Open;
            guard.probe_count = 0;
            guard.in_flight = 0;
            metrics::set_breaker_state(&self.name, CircuitState::Open);
            metrics::record_breaker_trip(&self.name);
            warn!(
                breaker = %self.name,
                from = %from,
                failures = guard.failure_count,
                "Circuit breaker tripped to OPEN"
            );
        }
    }

    /// Runs `f` through the breaker.
    ///
    /// Rejected calls return `BreakerError::Open` without invoking `f`.
    /// Any `Err` from `f` counts as a failure.
    pub async fn call<F, Fut, T, E>(&self, f: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if let Err(CircuitOpen { resource }) = self.try_acquire() {
            return Err(BreakerError::Open { resource });
        }

        match f().await {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(e) => {
                self.record_failure();
                Err(BreakerError::Inner(e))
            }
        }
    }

    /// Resets the breaker to its initial closed state.
    pub fn reset(&self) {
        let mut guard = self.lock();
        guard.state = CircuitState::Closed;
        guard.failure_count = 0;
        guard.probe_count = 0;
        guard.in_flight = 0;
        guard.last_failure_time = None;
        metrics::set_breaker_state(&self.name, CircuitState::Closed);
    }
}
