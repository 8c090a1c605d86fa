//! Failure taxonomy for the resilience core.
//!
//! Module-level errors (`TransportError`, `CheckError`, ...) stay close to the
//! code that produces them. This module defines the crate-wide classification
//! they map onto, which decides how a failure is handled:
//!
//! | Kind | Handling |
//! |---|---|
//! | `Connectivity` | retried via failover, then buffered |
//! | `Integrity` | message dropped, never accepted |
//! | `Timeout` | counted as a breaker failure |
//! | `CircuitOpen` | fast-fail, synthesized CRITICAL metric |
//! | `Playbook` | remediation aborted, escalated |
//! | `ManualInterventionRequired` | automated trading disabled until reset |

use std::time::Duration;
use thiserror::Error;

/// Classification of a failure, independent of where it originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FailureKind {
    Connectivity,
    Integrity,
    Timeout,
    CircuitOpen,
    Playbook,
    ManualInterventionRequired,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Connectivity => write!(f, "connectivity"),
            Self::Integrity => write!(f, "integrity"),
            Self::Timeout => write!(f, "timeout"),
            Self::CircuitOpen => write!(f, "circuit_open"),
            Self::Playbook => write!(f, "playbook"),
            Self::ManualInterventionRequired => write!(f, "manual_intervention_required"),
        }
    }
}

/// Crate-level error surfaced past the control loop.
///
/// Transient transport and check failures are recovered locally and do not
/// normally reach this type; it is what the orchestrator and the CLI see.
#[derive(Error, Debug)]
pub enum ResilienceError {
    #[error("Connectivity failure on {resource}: {reason}")]
    Connectivity { resource: String, reason: String },

    #[error("Integrity failure for message {msg_id}: checksum mismatch")]
    Integrity { msg_id: String },

    #[error("{operation} timed out after {after:?}")]
    Timeout { operation: String, after: Duration },

    #[error("Circuit open for {resource}")]
    CircuitOpen { resource: String },

    #[error("Playbook '{playbook}' failed: {reason}")]
    Playbook { playbook: String, reason: String },

    #[error("Manual intervention required: {reason}")]
    ManualInterventionRequired { reason: String },

    #[error("Configuration error: {0}")]
    Config(#[from] crate::config::ConfigError),

    #[error("Buffer error: {0}")]
    Buffer(#[from] crate::transport::BufferError),

    #[error("State persistence error: {0}")]
    State(#[from] crate::state::StateError),

    #[error("Latch error: {0}")]
    Latch(#[from] crate::remediation::LatchError),

    #[error("Transport error: {0}")]
    Transport(#[from] crate::transport::TransportError),
}

impl ResilienceError {
    /// Taxonomy bucket for this error, if it belongs to one.
    pub fn kind(&self) -> Option<FailureKind> {
        match self {
            Self::Connectivity { .. } => Some(FailureKind::Connectivity),
            Self::Integrity { .. } => Some(FailureKind::Integrity),
            Self::Timeout { .. } => Some(FailureKind::Timeout),
            Self::CircuitOpen { .. } => Some(FailureKind::CircuitOpen),
            Self::Playbook { .. } => Some(FailureKind::Playbook),
            Self::ManualInterventionRequired { .. } => {
                Some(FailureKind::ManualInterventionRequired)
            }
            Self::Transport(e) => Some(e.kind()),
            Self::Config(_) | Self::Buffer(_) | Self::State(_) | Self::Latch(_) => None,
        }
    }
}
