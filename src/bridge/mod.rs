//! Bridge manager collaborator.
//!
//! The bridge manager owns the command pipeline between the control core and
//! the external trading terminal. Transport resets and primary switches are
//! only performed after it has quiesced at a sequence boundary.

use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BridgeError {
    #[error("Quiesce incomplete: {pending} commands still in flight")]
    QuiesceIncomplete { pending: usize },

    #[error("Unknown bridge: {0}")]
    UnknownBridge(String),

    #[error("External agent restart failed: {0}")]
    AgentRestart(String),

    #[error("Bridge manager unavailable: {0}")]
    Unavailable(String),
}

/// Command sequencing and bridge selection.
#[async_trait]
pub trait BridgeManager: Send + Sync {
    /// Drain in-flight commands to completion. Callers bound this with a timeout.
    async fn quiesce_at_sequence_boundary(&self) -> Result<(), BridgeError>;

    /// Stop (or resume) accepting new commands.
    async fn set_command_pause(&self, paused: bool) -> Result<(), BridgeError>;

    /// Route commands through the named bridge from now on.
    async fn set_primary_bridge(&self, name: &str) -> Result<(), BridgeError>;

    /// Number of commands submitted but not yet acknowledged.
    async fn get_pending_commands(&self) -> Result<usize, BridgeError>;

    /// Restart the external trading agent process.
    async fn restart_external_agent(&self) -> Result<(), BridgeError>;
}
