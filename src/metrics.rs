//! Prometheus Metrics Module
//!
//! Pre-registered metrics for production observability of the control core.

use lazy_static::lazy_static;
use prometheus::{
    opts, register_gauge, register_gauge_vec, register_histogram_vec, register_int_counter_vec,
    Encoder, Gauge, GaugeVec, HistogramVec, IntCounterVec, TextEncoder,
};

use crate::resilience::CircuitState;

lazy_static! {
    // --- Mode / Health Metrics ---

    /// Current system mode (0=healthy, 1=recovering, 2=degraded, 3=safe_mode)
    pub static ref SYSTEM_MODE: Gauge = register_gauge!(
        opts!("tradeguard_system_mode", "Current system mode (0=healthy, 1=recovering, 2=degraded, 3=safe_mode)")
    ).expect("FATAL: Failed to register SYSTEM_MODE metric - check for duplicate registration");

    /// Per-check status (0=healthy, 1=recovering, 2=degraded, 3=critical)
    pub static ref CHECK_STATUS: GaugeVec = register_gauge_vec!(
        opts!("tradeguard_check_status", "Health check status (0=healthy, 1=recovering, 2=degraded, 3=critical)"),
        &["check"]
    ).expect("FATAL: Failed to register CHECK_STATUS metric - check for duplicate registration");

    // --- Circuit Breaker Metrics ---

    /// Circuit breaker state (0=closed, 1=half_open, 2=open)
    pub static ref CIRCUIT_BREAKER_STATE: GaugeVec = register_gauge_vec!(
        opts!("tradeguard_circuit_breaker_state", "Circuit breaker state (0=closed, 1=half_open, 2=open)"),
        &["name"]
    ).expect("FATAL: Failed to register CIRCUIT_BREAKER_STATE metric - check for duplicate registration");

    /// Circuit breaker trips
    pub static ref CIRCUIT_BREAKER_TRIPS: IntCounterVec = register_int_counter_vec!(
        opts!("tradeguard_circuit_breaker_trips_total", "Circuit breaker trips"),
        &["name"]
    ).expect("FATAL: Failed to register CIRCUIT_BREAKER_TRIPS metric - check for duplicate registration");

    // --- Transport Metrics ---

    /// Delivery attempts per transport
    pub static ref MESSAGES_SENT: IntCounterVec = register_int_counter_vec!(
        opts!("tradeguard_messages_sent_total", "Message delivery attempts per transport"),
        &["transport", "status"]
    ).expect("FATAL: Failed to register MESSAGES_SENT metric - check for duplicate registration");

    /// Messages that fell through to the store-and-forward buffer
    pub static ref MESSAGES_BUFFERED: IntCounterVec = register_int_counter_vec!(
        opts!("tradeguard_messages_buffered_total", "Messages written to the store-and-forward buffer"),
        &["msg_type"]
    ).expect("FATAL: Failed to register MESSAGES_BUFFERED metric - check for duplicate registration");

    /// Replay outcomes
    pub static ref REPLAY_OUTCOMES: IntCounterVec = register_int_counter_vec!(
        opts!("tradeguard_replay_total", "Buffered message replay outcomes"),
        &["outcome"]
    ).expect("FATAL: Failed to register REPLAY_OUTCOMES metric - check for duplicate registration");

    // --- Remediation Metrics ---

    /// Playbook runs
    pub static ref PLAYBOOK_RUNS: IntCounterVec = register_int_counter_vec!(
        opts!("tradeguard_playbook_runs_total", "Remediation playbook runs"),
        &["playbook", "outcome"]
    ).expect("FATAL: Failed to register PLAYBOOK_RUNS metric - check for duplicate registration");

    /// Remediation step duration in seconds
    pub static ref STEP_DURATION: HistogramVec = register_histogram_vec!(
        "tradeguard_remediation_step_seconds",
        "Remediation step duration",
        &["action", "outcome"],
        vec![0.01, 0.05, 0.1, 0.5, 1.0, 5.0, 15.0, 30.0, 60.0, 300.0]
    ).expect("FATAL: Failed to register STEP_DURATION metric - check for duplicate registration");
}

pub fn set_system_mode(value: f64) {
    SYSTEM_MODE.set(value);
}

pub fn set_check_status(check: &str, value: f64) {
    CHECK_STATUS.with_label_values(&[check]).set(value);
}

pub fn set_breaker_state(name: &str, state: CircuitState) {
    CIRCUIT_BREAKER_STATE
        .with_label_values(&[name])
        .set(state.as_gauge());
}

pub fn record_breaker_trip(name: &str) {
    CIRCUIT_BREAKER_TRIPS.with_label_values(&[name]).inc();
}

/// Record a delivery attempt on one transport
pub fn record_send(transport: &str, success: bool) {
    let status = if success { "success" } else { "failure" };
    MESSAGES_SENT.with_label_values(&[transport, status]).inc();
}

pub fn record_buffered(msg_type: &str) {
    MESSAGES_BUFFERED.with_label_values(&[msg_type]).inc();
}

pub fn record_replay(outcome: &str) {
    REPLAY_OUTCOMES.with_label_values(&[outcome]).inc();
}

pub fn record_playbook(playbook: &str, outcome: &str) {
    PLAYBOOK_RUNS.with_label_values(&[playbook, outcome]).inc();
}

pub fn record_step_duration(action: &str, success: bool, secs: f64) {
    let outcome = if success { "success" } else { "failure" };
    STEP_DURATION
        .with_label_values(&[action, outcome])
        .observe(secs);
}

/// Get metrics as text for /metrics endpoint
///
/// Encoding errors are logged and yield an empty body rather than a panic.
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::gather();
    let mut buffer = Vec::new();

    if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
        tracing::error!("Failed to encode Prometheus metrics: {}", e);
        return String::new();
    }

    match String::from_utf8(buffer) {
        Ok(s) => s,
        Err(e) => {
            tracing::error!("Prometheus metrics buffer is not valid UTF-8: {}", e);
            String::new()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gather_metrics() {
        record_send("TEST-TRANSPORT", true);

        let output = gather_metrics();
        assert!(
            output.contains("tradeguard_messages_sent_total"),
            "Expected metrics output to contain 'tradeguard_messages_sent_total', got: {}",
            &output[..output.len().min(200)]
        );
    }
}
