//! CLI command handlers.
//!
//! This module contains the implementation for each CLI subcommand,
//! delegating to the control loop, the transport router and the
//! remediation tooling.

mod admin;
mod messages;
mod run;

pub use admin::{run_reset_latch, run_status, run_validate_config, run_verify_checkpoint};
pub use messages::{run_replay, run_send};
pub use run::run_control_loop;
