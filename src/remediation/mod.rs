//! # Remediation Module
//!
//! Automated recovery from degraded operation.
//!
//! ## Components
//! - `playbook`: `RemediationAction` and the playbook data model
//! - `engine`: ordered, time-boxed playbook execution and escalation
//! - `latch`: persisted manual-intervention latch
//! - `checkpoint`: hashed emergency snapshots of broker state and config
//! - `positions`: graceful close-out with forced fallback
//! - `reconcile`: local position book vs broker truth

pub mod checkpoint;
pub mod engine;
pub mod latch;
pub mod playbook;
pub mod positions;
pub mod reconcile;

pub use checkpoint::{verify_checkpoint, write_checkpoint, CheckpointError, CheckpointVerification};
pub use engine::{
    ActionError, PlaybookOutcome, PlaybookReport, RemediationEngine, RemediationTrigger, StepReport,
};
pub use latch::{LatchError, LatchRecord, ManualLatch};
pub use playbook::{RemediationAction, RemediationPlaybook, RemediationStep};
pub use positions::{close_all_positions, CloseReport};
pub use reconcile::{PositionReconciler, ReconciliationAction, ReconciliationResult};
