//! Operator command handlers: configuration check, status, latch reset and
//! checkpoint verification.

use std::path::Path;

use tradeguard::config::RemediationConfig;
use tradeguard::remediation::latch::read_record;
use tradeguard::remediation::{verify_checkpoint, ManualLatch};
use tradeguard::state::ModeStore;
use tradeguard::transport::MessageBuffer;

/// Load and validate the configuration document.
///
/// # Errors
/// Returns the parse or validation error.
pub fn run_validate_config(config_path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let config = RemediationConfig::from_file(config_path)?;
    println!("✓ {} is valid", config_path.display());
    println!("  checks:     {}", config.health_checks.len());
    println!("  symbols:    {}", config.symbols.len());
    println!("  playbooks:  {}", config.playbooks.len());
    println!("  transports: {}", config.transports.endpoints.len());
    Ok(())
}

/// Print the persisted mode, latch state and buffer depth.
///
/// # Errors
/// Returns error if the configuration or a state file cannot be read.
pub async fn run_status(config_path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let config = RemediationConfig::from_file(config_path)?;

    match ModeStore::new(&config.state.mode_path).load()? {
        Some(record) => println!(
            "Mode:   {} (since {}, {})",
            record.mode, record.updated_at, record.reason
        ),
        None => println!("Mode:   no persisted mode"),
    }

    match read_record(&config.remediation.latch_path)? {
        Some(latch) => println!(
            "Latch:  ENGAGED at {} by {} ({})",
            latch.engaged_at, latch.trigger, latch.reason
        ),
        None => println!("Latch:  released"),
    }

    if config.buffer.path.exists() {
        let stats = MessageBuffer::open(&config.buffer.path)?.stats().await?;
        println!(
            "Buffer: {} pending, {} acknowledged, {} expired, {} exhausted ({} total)",
            stats.pending, stats.acknowledged, stats.expired, stats.exhausted, stats.total
        );
    } else {
        println!("Buffer: not created yet");
    }
    Ok(())
}

/// Remove the manual latch record.
///
/// # Errors
/// Returns error if the record exists but cannot be removed.
pub fn run_reset_latch(config_path: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let config = RemediationConfig::from_file(config_path)?;
    if ManualLatch::reset(&config.remediation.latch_path)? {
        println!("✓ Manual latch released; a running control loop resumes on its next tick");
    } else {
        println!("Manual latch was not engaged");
    }
    Ok(())
}

/// Recompute every hash in a checkpoint directory.
///
/// # Errors
/// Returns error if the manifest is missing or the checkpoint fails
/// verification.
pub fn run_verify_checkpoint(dir: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let report = verify_checkpoint(dir)?;
    if report.is_intact() {
        println!("✓ {} is intact", dir.display());
        return Ok(());
    }
    for name in &report.mismatched {
        println!("  modified:   {}", name);
    }
    for name in &report.missing {
        println!("  missing:    {}", name);
    }
    for name in &report.unexpected {
        println!("  unexpected: {}", name);
    }
    Err(format!("checkpoint {} failed verification", dir.display()).into())
}
