//! Message command handlers: one-off sends and buffer replay.

use std::path::Path;
use std::sync::Arc;

use tradeguard::config::RemediationConfig;
use tradeguard::orchestrator::build_router;
use tradeguard::paper::PaperBridge;
use tradeguard::transport::TransportMessage;

/// Send one message through the failover chain.
///
/// # Errors
/// Returns error if the payload is not JSON or the buffer cannot be written.
pub async fn run_send(
    config_path: &Path,
    msg_type: String,
    payload: &str,
    priority: i32,
) -> Result<(), Box<dyn std::error::Error>> {
    let config = RemediationConfig::from_file(config_path)?;
    let payload: serde_json::Value = serde_json::from_str(payload)?;
    // No live bridge manager outside the control loop; nothing to quiesce.
    let router = build_router(&config, Arc::new(PaperBridge::new()))?;

    let message = TransportMessage::new(msg_type, payload).with_priority(priority);
    let outcome = router.send_with_failover(&message).await?;
    println!("{} -> {}", message.msg_id, outcome);
    Ok(())
}

/// Run one replay pass and purge dead rows.
///
/// # Errors
/// Returns error if the buffer cannot be read or written.
pub async fn run_replay(config_path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let config = RemediationConfig::from_file(config_path)?;
    let router = build_router(&config, Arc::new(PaperBridge::new()))?;

    let report = router.buffer().replay(&router).await?;
    let purged = router.buffer().purge().await?;
    println!(
        "Replay: {} selected, {} delivered, {} re-buffered, {} dropped; {} rows purged",
        report.selected, report.delivered, report.rebuffered, report.dropped, purged
    );
    Ok(())
}
