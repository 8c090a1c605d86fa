//! # Resilience Module
//!
//! Reusable fault-tolerance patterns for the control core.
//!
//! ## Components
//! - `CircuitBreaker`: Per-resource failure isolation (CLOSED/OPEN/HALF_OPEN).
//! - `HysteresisEvaluator`: Adaptive baseline plus N-of-M debouncing.
//! - `BackoffPolicy`: Exponential backoff with jitter.

pub mod backoff;
pub mod circuit_breaker;
pub mod hysteresis;

// Re-export for convenience
pub use backoff::BackoffPolicy;
pub use circuit_breaker::{
    BreakerError, BreakerSettings, CircuitBreaker, CircuitBreakerState, CircuitOpen, CircuitState,
};
pub use hysteresis::{HysteresisDecision, HysteresisEvaluator, NOfMRule, RuleParseError};
