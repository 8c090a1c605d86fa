//! Alerting collaborator.
//!
//! Critical alerts fan out to every configured channel (pager, chat, email,
//! ...). Delivery to those channels is external; this module defines the
//! message shape, the `AlertSink` seam and a tracing-backed sink.

pub mod tracing_sink;

use std::collections::BTreeMap;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use tracing_sink::TracingAlertSink;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum AlertError {
    #[error("Alert channel '{channel}' failed: {reason}")]
    Channel { channel: String, reason: String },
    #[error("No alert channels configured")]
    NoChannels,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AlertSeverity {
    Info,
    Warning,
    Critical,
}

impl std::fmt::Display for AlertSeverity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Info => write!(f, "INFO"),
            Self::Warning => write!(f, "WARNING"),
            Self::Critical => write!(f, "CRITICAL"),
        }
    }
}

/// An operator-facing alert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlertMessage {
    pub severity: AlertSeverity,
    pub title: String,
    /// Condition that triggered the alert (check name, playbook, ...)
    pub trigger: String,
    pub detail: String,
    /// Relevant metric values at the time of the alert
    pub metrics: BTreeMap<String, f64>,
    pub timestamp: DateTime<Utc>,
}

impl AlertMessage {
    pub fn critical(
        title: impl Into<String>,
        trigger: impl Into<String>,
        detail: impl Into<String>,
    ) -> Self {
        Self {
            severity: AlertSeverity::Critical,
            title: title.into(),
            trigger: trigger.into(),
            detail: detail.into(),
            metrics: BTreeMap::new(),
            timestamp: Utc::now(),
        }
    }

    #[must_use]
    pub fn with_metric(mut self, name: impl Into<String>, value: f64) -> Self {
        self.metrics.insert(name.into(), value);
        self
    }

    /// One-line rendering for chat/pager channels.
    pub fn summary(&self) -> String {
        let metrics = self
            .metrics
            .iter()
            .map(|(k, v)| format!("{}={:.3}", k, v))
            .collect::<Vec<_>>()
            .join(", ");
        if metrics.is_empty() {
            format!("[{}] {} ({}): {}", self.severity, self.title, self.trigger, self.detail)
        } else {
            format!(
                "[{}] {} ({}): {} [{}]",
                self.severity, self.title, self.trigger, self.detail, metrics
            )
        }
    }
}

/// Multi-channel alert delivery.
#[async_trait]
pub trait AlertSink: Send + Sync {
    async fn send(&self, channels: &[String], message: &AlertMessage) -> Result<(), AlertError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_summary_includes_trigger_and_metrics() {
        let alert = AlertMessage::critical("Playbook failed", "bridge_latency", "step 2 timed out")
            .with_metric("latency_ms", 2500.0);
        let summary = alert.summary();
        assert!(summary.starts_with("[CRITICAL] Playbook failed (bridge_latency)"));
        assert!(summary.contains("latency_ms=2500.000"));
    }
}
