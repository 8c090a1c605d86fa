//! Tracing-based Alert Sink
//!
//! Emits structured logs for alerts that can be captured by any tracing
//! subscriber or log shipper. Zero additional dependencies.

use super::{AlertError, AlertMessage, AlertSeverity, AlertSink};
use async_trait::async_trait;
use tracing::{error, info, warn};

/// Sink that emits one structured log line per channel.
pub struct TracingAlertSink;

impl TracingAlertSink {
    pub fn new() -> Self {
        Self
    }
}

impl Default for TracingAlertSink {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl AlertSink for TracingAlertSink {
    async fn send(&self, channels: &[String], message: &AlertMessage) -> Result<(), AlertError> {
        if channels.is_empty() {
            return Err(AlertError::NoChannels);
        }
        for channel in channels {
            let summary = message.summary();
            match message.severity {
                AlertSeverity::Critical => error!(
                    target: "alerts",
                    channel = %channel,
                    trigger = %message.trigger,
                    timestamp = %message.timestamp.to_rfc3339(),
                    "{}", summary
                ),
                AlertSeverity::Warning => warn!(
                    target: "alerts",
                    channel = %channel,
                    trigger = %message.trigger,
                    "{}", summary
                ),
                AlertSeverity::Info => info!(
                    target: "alerts",
                    channel = %channel,
                    trigger = %message.trigger,
                    "{}", summary
                ),
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_tracing_sink_requires_channels() {
        let sink = TracingAlertSink::new();
        let alert = AlertMessage::critical("t", "trigger", "detail");

        assert_eq!(sink.send(&[], &alert).await, Err(AlertError::NoChannels));
        sink.send(&["ops".to_string(), "pager".to_string()], &alert)
            .await
            .unwrap();
    }
}
