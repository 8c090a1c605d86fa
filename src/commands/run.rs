//! Run command handler.
//!
//! Wires the configured transports, the collaborators and the optional
//! status server around the [`Orchestrator`] and runs until Ctrl-C.

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use tradeguard::alerts::TracingAlertSink;
use tradeguard::config::RemediationConfig;
use tradeguard::health::server::{create_health_state, run_health_server};
use tradeguard::orchestrator::{build_router, Collaborators, Orchestrator};
use tradeguard::paper::{PaperBridge, PaperBroker, PaperFeed};

/// Interval at which the paper feed records a tick for every symbol.
const PAPER_TICK_INTERVAL: Duration = Duration::from_secs(1);

/// Run the control loop until interrupted.
///
/// # Arguments
/// * `config_path` - Remediation configuration document
/// * `paper` - Use in-memory collaborators
/// * `health_port` - Serve `/health` and `/metrics` on this port
///
/// # Errors
/// Returns error if the configuration, buffer, transports or persisted
/// state cannot be loaded.
pub async fn run_control_loop(
    config_path: &Path,
    paper: bool,
    health_port: Option<u16>,
) -> Result<(), Box<dyn std::error::Error>> {
    if !paper {
        return Err("live broker and bridge collaborators are supplied by the terminal integration; \
                    run with --paper to use the in-memory ones"
            .into());
    }

    let config = Arc::new(RemediationConfig::from_file(config_path)?);
    info!(
        config = %config_path.display(),
        checks = config.health_checks.len(),
        transports = config.transports.endpoints.len(),
        "Configuration loaded"
    );

    let shutdown = CancellationToken::new();
    let bridge = Arc::new(PaperBridge::new());
    let feed = Arc::new(PaperFeed::new());
    let collaborators = Collaborators {
        broker: Arc::new(PaperBroker::new()),
        bridge: bridge.clone(),
        feed: feed.clone(),
        alerts: Arc::new(TracingAlertSink::new()),
    };

    let ticker = {
        let symbols = config.symbols.clone();
        let shutdown = shutdown.child_token();
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(PAPER_TICK_INTERVAL);
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = interval.tick() => {
                        for symbol in &symbols {
                            feed.record_tick(symbol);
                        }
                    }
                }
            }
        })
    };

    let router = build_router(&config, bridge)?;
    let mut orchestrator = Orchestrator::new(Arc::clone(&config), router, collaborators)?;

    let server = match health_port {
        Some(port) => {
            let state = create_health_state();
            orchestrator = orchestrator.with_health_state(state.clone());
            Some(tokio::spawn(run_health_server(port, state, shutdown.child_token())))
        }
        None => None,
    };

    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("Shutdown signal received"),
                Err(e) => warn!(error = %e, "Failed to listen for Ctrl-C, shutting down"),
            }
            shutdown.cancel();
        });
    }

    orchestrator.run(shutdown.clone()).await;

    shutdown.cancel();
    if let Some(server) = server {
        server.await?;
    }
    ticker.await?;
    info!("Shutdown complete");
    Ok(())
}
