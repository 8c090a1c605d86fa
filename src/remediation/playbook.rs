//! Playbook definitions.
//!
//! A playbook is an ordered list of steps, each naming one idempotent
//! [`RemediationAction`]. Playbooks are configuration data and are never
//! mutated after load.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Every recovery action the engine knows how to perform.
///
/// Configuration refers to actions by their kebab- or snake-case name; an
/// unknown name is a load error, never a runtime branch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemediationAction {
    #[serde(alias = "pause-new-commands")]
    PauseNewCommands,
    #[serde(alias = "quiesce-at-sequence-boundary")]
    QuiesceAtSequenceBoundary,
    #[serde(alias = "reset-all-bridges-in-priority-order")]
    ResetAllBridgesInPriorityOrder,
    #[serde(alias = "restart-external-agent")]
    RestartExternalAgent,
    #[serde(alias = "reconcile-with-broker-truth")]
    ReconcileWithBrokerTruth,
    #[serde(alias = "switch-primary-transport")]
    SwitchPrimaryTransport,
    #[serde(alias = "close-all-positions-gracefully")]
    CloseAllPositionsGracefully,
    #[serde(alias = "engage-manual-latch")]
    EngageManualLatch,
    #[serde(alias = "create-emergency-checkpoint")]
    CreateEmergencyCheckpoint,
    #[serde(alias = "send-critical-alert")]
    SendCriticalAlert,
}

impl RemediationAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::PauseNewCommands => "pause-new-commands",
            Self::QuiesceAtSequenceBoundary => "quiesce-at-sequence-boundary",
            Self::ResetAllBridgesInPriorityOrder => "reset-all-bridges-in-priority-order",
            Self::RestartExternalAgent => "restart-external-agent",
            Self::ReconcileWithBrokerTruth => "reconcile-with-broker-truth",
            Self::SwitchPrimaryTransport => "switch-primary-transport",
            Self::CloseAllPositionsGracefully => "close-all-positions-gracefully",
            Self::EngageManualLatch => "engage-manual-latch",
            Self::CreateEmergencyCheckpoint => "create-emergency-checkpoint",
            Self::SendCriticalAlert => "send-critical-alert",
        }
    }
}

impl std::fmt::Display for RemediationAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One step of a playbook.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemediationStep {
    pub name: String,
    pub action: RemediationAction,
    #[serde(with = "crate::config::duration")]
    pub timeout: Duration,
    #[serde(default)]
    pub continue_on_failure: bool,
}

impl RemediationStep {
    pub fn new(name: impl Into<String>, action: RemediationAction, timeout: Duration) -> Self {
        Self {
            name: name.into(),
            action,
            timeout,
            continue_on_failure: false,
        }
    }

    #[must_use]
    pub fn continue_on_failure(mut self) -> Self {
        self.continue_on_failure = true;
        self
    }
}

/// A named, time-boxed sequence of steps.
#[derive(Debug, Clone, PartialEq)]
pub struct RemediationPlaybook {
    pub name: String,
    pub max_duration: Duration,
    pub steps: Vec<RemediationStep>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_action_accepts_both_spellings() {
        let a: RemediationAction = serde_yaml::from_str("reset-all-bridges-in-priority-order").unwrap();
        let b: RemediationAction = serde_yaml::from_str("reset_all_bridges_in_priority_order").unwrap();
        assert_eq!(a, b);
        assert!(serde_yaml::from_str::<RemediationAction>("reboot-the-datacenter").is_err());
    }

    #[test]
    fn test_step_defaults_to_abort_on_failure() {
        let step: RemediationStep =
            serde_yaml::from_str("name: pause\naction: pause-new-commands\ntimeout: 5s\n").unwrap();
        assert_eq!(step.timeout, Duration::from_secs(5));
        assert!(!step.continue_on_failure);
    }
}
