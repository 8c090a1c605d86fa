//! # Transport Module
//!
//! Outbound delivery across several channels with failover and durable
//! store-and-forward buffering.
//!
//! ## Components
//! - `TransportMessage`: checksummed message envelope
//! - `Transport`: one delivery channel (socket, CSV spool, ...)
//! - `TransportRouter`: priority-ordered failover plus background recovery
//! - `MessageBuffer`: SQLite-backed queue for undeliverable messages
//! - `MessageDeduplicator`: receiver-side `msg_id` suppression

pub mod buffer;
pub mod dedup;
pub mod message;
pub mod router;
pub mod socket;
pub mod spool;

use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::Mutex;
use std::time::Duration;
use thiserror::Error;

use crate::error::FailureKind;

pub use buffer::{BufferError, BufferStats, MessageBuffer, ReplayReport};
pub use dedup::MessageDeduplicator;
pub use message::{compute_checksum, TransportMessage};
pub use router::{DeliveryOutcome, RouteStatus, RouterHandle, RouterSettings, TransportRouter};
pub use socket::{serve_socket_inbound, SocketTransport};
pub use spool::SpoolTransport;

/// Latency samples kept per transport.
const LATENCY_SAMPLES: usize = 20;

#[derive(Error, Debug)]
pub enum TransportError {
    #[error("Transport {transport} unreachable: {reason}")]
    Connectivity { transport: String, reason: String },

    #[error("Transport {transport} timed out after {after:?}")]
    Timeout { transport: String, after: Duration },

    #[error("Checksum mismatch for message {msg_id}")]
    Integrity { msg_id: String },

    #[error("Circuit open for transport {transport}")]
    CircuitOpen { transport: String },

    #[error("Receiver rejected message {msg_id}")]
    Rejected { msg_id: String },

    #[error("Frame of {0} bytes exceeds the limit")]
    FrameTooLarge(usize),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

impl TransportError {
    pub fn kind(&self) -> FailureKind {
        match self {
            Self::Integrity { .. } | Self::Rejected { .. } | Self::Codec(_) => {
                FailureKind::Integrity
            }
            Self::Timeout { .. } => FailureKind::Timeout,
            Self::CircuitOpen { .. } => FailureKind::CircuitOpen,
            Self::Connectivity { .. } | Self::FrameTooLarge(_) | Self::Io(_) => {
                FailureKind::Connectivity
            }
        }
    }
}

/// Live, unpersisted snapshot of one transport.
#[derive(Debug, Clone, PartialEq, serde::Serialize)]
pub struct TransportHealth {
    pub name: String,
    pub connected: bool,
    pub messages_sent: u64,
    pub messages_received: u64,
    pub last_error: Option<String>,
    /// Recent round-trip latencies in milliseconds, oldest first
    pub latency_samples: Vec<f64>,
}

impl TransportHealth {
    pub fn avg_latency_ms(&self) -> Option<f64> {
        if self.latency_samples.is_empty() {
            None
        } else {
            Some(self.latency_samples.iter().sum::<f64>() / self.latency_samples.len() as f64)
        }
    }
}

/// A delivery channel.
#[async_trait]
pub trait Transport: Send + Sync {
    fn name(&self) -> &str;

    /// Deliver one message; `Ok` means the far side accepted it.
    async fn send(&self, message: &TransportMessage) -> Result<(), TransportError>;

    /// Drain messages that arrived on this channel, already checksum-verified
    /// and deduplicated.
    async fn receive(&self) -> Result<Vec<TransportMessage>, TransportError> {
        Ok(Vec::new())
    }

    fn health(&self) -> TransportHealth;

    /// Tear down and re-establish the channel.
    async fn reset(&self) -> Result<(), TransportError>;

    /// Measure one round trip without carrying real traffic.
    async fn probe_latency(&self) -> Result<Duration, TransportError>;
}

/// Counters shared by the built-in transports.
#[derive(Debug)]
pub(crate) struct TransportStats {
    inner: Mutex<StatsInner>,
}

#[derive(Debug)]
struct StatsInner {
    connected: bool,
    messages_sent: u64,
    messages_received: u64,
    last_error: Option<String>,
    latency_samples: VecDeque<f64>,
}

impl TransportStats {
    pub(crate) fn new(connected: bool) -> Self {
        Self {
            inner: Mutex::new(StatsInner {
                connected,
                messages_sent: 0,
                messages_received: 0,
                last_error: None,
                latency_samples: VecDeque::with_capacity(LATENCY_SAMPLES),
            }),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StatsInner> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn record_sent(&self, latency: Duration) {
        let mut s = self.lock();
        s.connected = true;
        s.messages_sent += 1;
        push_sample(&mut s.latency_samples, latency);
    }

    pub(crate) fn record_latency(&self, latency: Duration) {
        push_sample(&mut self.lock().latency_samples, latency);
    }

    pub(crate) fn record_received(&self, count: u64) {
        self.lock().messages_received += count;
    }

    pub(crate) fn record_error(&self, err: &TransportError) {
        let mut s = self.lock();
        s.last_error = Some(err.to_string());
        if err.kind() == FailureKind::Connectivity || err.kind() == FailureKind::Timeout {
            s.connected = false;
        }
    }

    pub(crate) fn set_connected(&self, connected: bool) {
        self.lock().connected = connected;
    }

    pub(crate) fn snapshot(&self, name: &str) -> TransportHealth {
        let s = self.lock();
        TransportHealth {
            name: name.to_string(),
            connected: s.connected,
            messages_sent: s.messages_sent,
            messages_received: s.messages_received,
            last_error: s.last_error.clone(),
            latency_samples: s.latency_samples.iter().copied().collect(),
        }
    }
}

fn push_sample(samples: &mut VecDeque<f64>, latency: Duration) {
    if samples.len() == LATENCY_SAMPLES {
        samples.pop_front();
    }
    samples.push_back(latency.as_secs_f64() * 1000.0);
}
