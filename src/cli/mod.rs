//! CLI argument parsing using clap.
//!
//! This module defines the command-line interface for tradeguard,
//! including all subcommands and their arguments.

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tradeguard::observability::LogFormat;

/// tradeguard - resilience control core for a trading connectivity stack
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
pub struct Cli {
    /// The subcommand to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Path to the remediation configuration document
    #[arg(long, global = true, env = "TRADEGUARD_CONFIG", default_value = "tradeguard.yaml")]
    pub config: PathBuf,

    /// Set the verbosity level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    pub verbose: String,

    /// Log line format
    #[arg(long, global = true, value_enum, default_value_t = LogFormat::Text)]
    pub log_format: LogFormat,
}

/// Available CLI commands
#[derive(Subcommand)]
pub enum Commands {
    /// Run the health-monitoring and remediation control loop
    Run {
        /// Use in-memory broker, bridge and feed collaborators
        #[arg(long, default_value_t = false)]
        paper: bool,
        /// Serve /health and /metrics on this port
        #[arg(long)]
        health_port: Option<u16>,
    },

    /// Load and validate the configuration document, then exit
    ValidateConfig,

    /// Show persisted mode, latch state and buffer depth
    Status,

    /// Send one message through the transport failover chain
    Send {
        /// Message type
        #[arg(long)]
        msg_type: String,
        /// JSON payload
        #[arg(long)]
        payload: String,
        /// Replay priority (higher first)
        #[arg(long, default_value_t = 0)]
        priority: i32,
    },

    /// Run one replay pass over the store-and-forward buffer
    Replay,

    /// Release the manual latch (operator action)
    ResetLatch,

    /// Recompute the hashes of an emergency checkpoint
    VerifyCheckpoint {
        /// Checkpoint directory
        dir: PathBuf,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_run_with_globals() {
        let cli = Cli::try_parse_from([
            "tradeguard",
            "run",
            "--paper",
            "--health-port",
            "9100",
            "--config",
            "ops.yaml",
            "--log-format",
            "json",
        ])
        .unwrap();
        assert_eq!(cli.config, PathBuf::from("ops.yaml"));
        assert_eq!(cli.log_format, LogFormat::Json);
        match cli.command {
            Commands::Run { paper, health_port } => {
                assert!(paper);
                assert_eq!(health_port, Some(9100));
            }
            _ => panic!("expected run"),
        }
    }

    #[test]
    fn test_send_requires_payload() {
        assert!(Cli::try_parse_from(["tradeguard", "send", "--msg-type", "order"]).is_err());
    }
}
