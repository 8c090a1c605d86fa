mod cli;
mod commands;

use clap::Parser;
use dotenv::dotenv;

use cli::{Cli, Commands};
use tradeguard::observability::init_tracing;

// --- Main Application Logic ---
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load environment variables from the .env file
    dotenv().ok();

    let cli = Cli::parse();

    init_tracing(&cli.verbose, cli.log_format)?;

    match cli.command {
        Commands::Run { paper, health_port } => {
            commands::run_control_loop(&cli.config, paper, health_port).await?;
        }
        Commands::ValidateConfig => {
            commands::run_validate_config(&cli.config)?;
        }
        Commands::Status => {
            commands::run_status(&cli.config).await?;
        }
        Commands::Send {
            msg_type,
            payload,
            priority,
        } => {
            commands::run_send(&cli.config, msg_type, &payload, priority).await?;
        }
        Commands::Replay => {
            commands::run_replay(&cli.config).await?;
        }
        Commands::ResetLatch => {
            commands::run_reset_latch(&cli.config)?;
        }
        Commands::VerifyCheckpoint { dir } => {
            commands::run_verify_checkpoint(&dir)?;
        }
    }

    Ok(())
}
