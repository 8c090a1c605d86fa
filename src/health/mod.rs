//! # Health Module
//!
//! Periodic health checks feeding the system mode.
//!
//! ## Components
//! - `HealthProbe`: one measurable signal (latency, backlog, tick age, ...)
//! - `HealthMonitor`: runs every configured check per tick through its own
//!   circuit breaker and hysteresis evaluator
//! - `server`: `/health` and `/metrics` HTTP endpoints

pub mod monitor;
pub mod probes;
pub mod server;

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::bridge::BridgeError;
use crate::broker::BrokerError;
use crate::error::FailureKind;
use crate::feed::FeedError;
use crate::transport::{BufferError, TransportError};

pub use monitor::HealthMonitor;
pub use probes::ProbeSet;

/// Status of one check after hysteresis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthStatus {
    Healthy,
    Degraded,
    /// Leaving CRITICAL, not yet confirmed healthy
    Recovering,
    Critical,
}

impl HealthStatus {
    /// Gauge encoding (0=healthy, 1=recovering, 2=degraded, 3=critical)
    pub fn as_gauge(self) -> f64 {
        match self {
            HealthStatus::Healthy => 0.0,
            HealthStatus::Recovering => 1.0,
            HealthStatus::Degraded => 2.0,
            HealthStatus::Critical => 3.0,
        }
    }
}

impl std::fmt::Display for HealthStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HealthStatus::Healthy => write!(f, "HEALTHY"),
            HealthStatus::Degraded => write!(f, "DEGRADED"),
            HealthStatus::Recovering => write!(f, "RECOVERING"),
            HealthStatus::Critical => write!(f, "CRITICAL"),
        }
    }
}

/// Result of one check on one tick.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HealthMetric {
    /// Check name, suffixed with `:<symbol>` for per-symbol checks
    pub name: String,
    pub status: HealthStatus,
    /// Probe value; NaN when the probe failed or was not run
    pub value: f64,
    pub timestamp: DateTime<Utc>,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
}

#[derive(Error, Debug)]
pub enum CheckError {
    #[error("Check {check} timed out after {after:?}")]
    Timeout { check: String, after: Duration },

    #[error("Check needs a symbol")]
    MissingSymbol,

    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Bridge(#[from] BridgeError),

    #[error(transparent)]
    Feed(#[from] FeedError),

    #[error(transparent)]
    Buffer(#[from] BufferError),
}

impl CheckError {
    pub fn kind(&self) -> FailureKind {
        match self {
            CheckError::Timeout { .. } => FailureKind::Timeout,
            CheckError::Transport(e) => e.kind(),
            _ => FailureKind::Connectivity,
        }
    }
}

/// A measurable signal. Larger values are worse.
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Measure once. `symbol` is set for per-symbol checks.
    async fn probe(&self, symbol: Option<&str>) -> Result<f64, CheckError>;
}
