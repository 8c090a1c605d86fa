//! Playbook execution.
//!
//! A run moves the system to RECOVERING, then executes steps strictly in
//! order. The `max_duration` budget is checked before each step; a step that
//! is already running is bounded only by its own timeout. A failed step
//! aborts the run unless it is marked `continue_on_failure`, and an aborted
//! run escalates exactly once: the manual latch is engaged, new commands are
//! paused, every alert channel is notified and the system enters SAFE_MODE.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;
use tracing::{error, info, warn};

use super::checkpoint::{write_checkpoint, CheckpointError};
use super::latch::{LatchError, ManualLatch};
use super::positions::close_all_positions;
use super::reconcile::{PositionReconciler, ReconciliationAction};
use super::{RemediationAction, RemediationPlaybook, RemediationStep};
use crate::alerts::{AlertError, AlertMessage, AlertSink};
use crate::bridge::{BridgeError, BridgeManager};
use crate::broker::{Broker, BrokerError};
use crate::config::RemediationConfig;
use crate::metrics;
use crate::state::{StateMachine, SystemMode};
use crate::transport::router::SwitchError;
use crate::transport::TransportRouter;

#[derive(Error, Debug)]
pub enum ActionError {
    #[error(transparent)]
    Bridge(#[from] BridgeError),

    #[error(transparent)]
    Broker(#[from] BrokerError),

    #[error(transparent)]
    Switch(#[from] SwitchError),

    #[error(transparent)]
    Checkpoint(#[from] CheckpointError),

    #[error(transparent)]
    Alert(#[from] AlertError),

    #[error(transparent)]
    Latch(#[from] LatchError),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("{0}")]
    Incomplete(String),
}

/// What started a remediation run.
#[derive(Debug, Clone, PartialEq)]
pub struct RemediationTrigger {
    /// Check name, or the mode for mode-level fallbacks
    pub source: String,
    pub mode: SystemMode,
    pub metrics: BTreeMap<String, f64>,
}

impl RemediationTrigger {
    pub fn new(source: impl Into<String>, mode: SystemMode) -> Self {
        Self {
            source: source.into(),
            mode,
            metrics: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn with_metric(mut self, name: impl Into<String>, value: f64) -> Self {
        self.metrics.insert(name.into(), value);
        self
    }

    fn alert(&self, title: &str, detail: impl Into<String>) -> AlertMessage {
        self.metrics
            .iter()
            .filter(|(_, v)| v.is_finite())
            .fold(
                AlertMessage::critical(title, &self.source, detail),
                |alert, (k, v)| alert.with_metric(k.clone(), *v),
            )
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct StepReport {
    pub name: String,
    pub action: RemediationAction,
    pub elapsed: Duration,
    pub error: Option<String>,
}

impl StepReport {
    pub fn succeeded(&self) -> bool {
        self.error.is_none()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PlaybookOutcome {
    Completed,
    /// Aborted and handed to the operator
    Escalated { reason: String },
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlaybookReport {
    pub playbook: String,
    pub outcome: PlaybookOutcome,
    pub steps: Vec<StepReport>,
    pub elapsed: Duration,
}

impl PlaybookReport {
    pub fn is_completed(&self) -> bool {
        self.outcome == PlaybookOutcome::Completed
    }
}

/// Collaborators a remediation run acts on.
pub struct RemediationEngine {
    config: Arc<RemediationConfig>,
    state: Arc<StateMachine>,
    router: Arc<TransportRouter>,
    broker: Arc<dyn Broker>,
    bridge: Arc<dyn BridgeManager>,
    alerts: Arc<dyn AlertSink>,
    latch: Arc<ManualLatch>,
    reconciler: PositionReconciler,
    /// Set when this engine paused commands, so recovery can lift the pause
    paused: AtomicBool,
}

impl RemediationEngine {
    pub fn new(
        config: Arc<RemediationConfig>,
        state: Arc<StateMachine>,
        router: Arc<TransportRouter>,
        broker: Arc<dyn Broker>,
        bridge: Arc<dyn BridgeManager>,
        alerts: Arc<dyn AlertSink>,
        latch: Arc<ManualLatch>,
    ) -> Self {
        let reconciler =
            PositionReconciler::new(Arc::clone(&broker), config.remediation.reconcile_halt_threshold);
        Self {
            config,
            state,
            router,
            broker,
            bridge,
            alerts,
            latch,
            reconciler,
            paused: AtomicBool::new(false),
        }
    }

    pub fn reconciler(&self) -> &PositionReconciler {
        &self.reconciler
    }

    pub fn commands_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    /// Execute `playbook` for `trigger`.
    pub async fn run_playbook(
        &self,
        playbook: &RemediationPlaybook,
        trigger: &RemediationTrigger,
    ) -> PlaybookReport {
        let started = Instant::now();
        if let Err(e) = self.state.transition_to(
            SystemMode::Recovering,
            format!("playbook {} for {}", playbook.name, trigger.source),
        ) {
            warn!(error = %e, "Failed to persist RECOVERING mode");
        }
        warn!(
            playbook = %playbook.name,
            trigger = %trigger.source,
            steps = playbook.steps.len(),
            budget = ?playbook.max_duration,
            "Remediation playbook started"
        );

        let mut steps = Vec::with_capacity(playbook.steps.len());
        let mut failure = None;
        for step in &playbook.steps {
            let elapsed = started.elapsed();
            if elapsed >= playbook.max_duration {
                failure = Some(format!(
                    "time budget {:?} exhausted before step '{}'",
                    playbook.max_duration, step.name
                ));
                break;
            }

            let report = self.run_step(step, trigger).await;
            let failed = !report.succeeded();
            if failed && !step.continue_on_failure {
                failure = Some(format!(
                    "step '{}' ({}) failed: {}",
                    step.name,
                    step.action,
                    report.error.as_deref().unwrap_or("unknown")
                ));
            }
            steps.push(report);
            if failure.is_some() {
                break;
            }
        }

        let elapsed = started.elapsed();
        let outcome = match failure {
            None => {
                info!(playbook = %playbook.name, elapsed = ?elapsed, "Remediation playbook completed");
                metrics::record_playbook(&playbook.name, "completed");
                PlaybookOutcome::Completed
            }
            Some(reason) => {
                error!(playbook = %playbook.name, elapsed = ?elapsed, reason = %reason, "Remediation playbook failed");
                metrics::record_playbook(&playbook.name, "escalated");
                self.escalate(trigger, &playbook.name, &reason).await;
                PlaybookOutcome::Escalated { reason }
            }
        };

        PlaybookReport {
            playbook: playbook.name.clone(),
            outcome,
            steps,
            elapsed,
        }
    }

    async fn run_step(&self, step: &RemediationStep, trigger: &RemediationTrigger) -> StepReport {
        let started = Instant::now();
        let result = match tokio::time::timeout(step.timeout, self.perform(step.action, trigger)).await
        {
            Ok(result) => result,
            Err(_) => Err(ActionError::Timeout(step.timeout)),
        };
        let elapsed = started.elapsed();
        metrics::record_step_duration(step.action.as_str(), result.is_ok(), elapsed.as_secs_f64());

        match &result {
            Ok(()) => info!(step = %step.name, action = %step.action, elapsed = ?elapsed, "Remediation step succeeded"),
            Err(e) => warn!(
                step = %step.name,
                action = %step.action,
                elapsed = ?elapsed,
                continue_on_failure = step.continue_on_failure,
                error = %e,
                "Remediation step failed"
            ),
        }

        StepReport {
            name: step.name.clone(),
            action: step.action,
            elapsed,
            error: result.err().map(|e| e.to_string()),
        }
    }

    /// Perform a single action. Every action is safe to repeat.
    pub async fn perform(
        &self,
        action: RemediationAction,
        trigger: &RemediationTrigger,
    ) -> Result<(), ActionError> {
        match action {
            RemediationAction::PauseNewCommands => self.pause_commands().await,
            RemediationAction::QuiesceAtSequenceBoundary => self.quiesce().await,
            RemediationAction::ResetAllBridgesInPriorityOrder => self.reset_all_bridges().await,
            RemediationAction::RestartExternalAgent => {
                Ok(self.bridge.restart_external_agent().await?)
            }
            RemediationAction::ReconcileWithBrokerTruth => self.reconcile().await,
            RemediationAction::SwitchPrimaryTransport => self.switch_primary().await,
            RemediationAction::CloseAllPositionsGracefully => self.close_all().await,
            RemediationAction::EngageManualLatch => {
                self.latch
                    .engage(&trigger.source, "engaged by remediation step")?;
                Ok(())
            }
            RemediationAction::CreateEmergencyCheckpoint => self.checkpoint().await,
            RemediationAction::SendCriticalAlert => {
                let alert = trigger.alert(
                    "Remediation in progress",
                    format!("system mode {}, automated recovery running", trigger.mode),
                );
                Ok(self
                    .alerts
                    .send(&self.config.remediation.alert_channels, &alert)
                    .await?)
            }
        }
    }

    async fn pause_commands(&self) -> Result<(), ActionError> {
        self.bridge.set_command_pause(true).await?;
        self.paused.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn quiesce(&self) -> Result<(), ActionError> {
        let timeout = self.config.remediation.quiesce_timeout;
        match tokio::time::timeout(timeout, self.bridge.quiesce_at_sequence_boundary()).await {
            Ok(result) => Ok(result?),
            Err(_) => Err(ActionError::Timeout(timeout)),
        }
    }

    /// Quiesce, then reset every transport primary first. Succeeds when at
    /// least one transport came back.
    async fn reset_all_bridges(&self) -> Result<(), ActionError> {
        self.quiesce().await?;
        let results = self.router.reset_all_in_priority_order().await;
        if results.iter().any(|(_, r)| r.is_ok()) {
            return Ok(());
        }
        let failed: Vec<&str> = results.iter().map(|(name, _)| name.as_str()).collect();
        Err(ActionError::Incomplete(format!(
            "no transport recovered after reset: {}",
            failed.join(", ")
        )))
    }

    async fn reconcile(&self) -> Result<(), ActionError> {
        let results = self.reconciler.reconcile_all().await?;
        let halted: Vec<&str> = results
            .iter()
            .filter(|r| r.action_taken == ReconciliationAction::TradingHalted)
            .map(|r| r.symbol.as_str())
            .collect();
        if halted.is_empty() {
            Ok(())
        } else {
            Err(ActionError::Incomplete(format!(
                "position drift halted {}",
                halted.join(", ")
            )))
        }
    }

    async fn switch_primary(&self) -> Result<(), ActionError> {
        match self.router.switch_to_fastest().await? {
            Some(name) => info!(transport = %name, "Primary transport switched by remediation"),
            None => info!("Current primary transport kept, no faster alternative"),
        }
        Ok(())
    }

    async fn close_all(&self) -> Result<(), ActionError> {
        let settings = &self.config.remediation;
        let report = close_all_positions(
            self.broker.as_ref(),
            settings.max_slippage,
            settings.graceful_close_ratio,
        )
        .await?;
        for (symbol, volume) in &report.closed_volume {
            self.reconciler.update_local_position(symbol, -*volume).await;
        }
        if report.is_success(settings.graceful_close_ratio) {
            Ok(())
        } else {
            Err(ActionError::Incomplete(format!(
                "graceful close ratio {:.2} below {:.2}, {} position(s) still open",
                report.graceful_ratio,
                settings.graceful_close_ratio,
                report.failed.len()
            )))
        }
    }

    async fn checkpoint(&self) -> Result<(), ActionError> {
        let positions = self.broker.get_active_positions().await?;
        let orders = self.broker.get_active_orders().await?;
        let config = Arc::clone(&self.config);
        let dir = tokio::task::spawn_blocking(move || {
            write_checkpoint(&config.remediation.checkpoint_dir, &positions, &orders, &config)
        })
        .await
        .map_err(|e| ActionError::Incomplete(format!("checkpoint task failed: {}", e)))??;
        info!(dir = %dir.display(), "Emergency checkpoint created");
        Ok(())
    }

    /// Hand control to the operator. Each step is attempted even if an
    /// earlier one fails.
    pub async fn escalate(&self, trigger: &RemediationTrigger, playbook: &str, reason: &str) {
        error!(
            playbook,
            trigger = %trigger.source,
            reason,
            "ESCALATION: manual intervention required"
        );

        if let Err(e) = self.latch.engage(&trigger.source, reason) {
            error!(error = %e, "Failed to persist manual latch record");
        }
        if let Err(e) = self.pause_commands().await {
            error!(error = %e, "Failed to pause commands during escalation");
        }

        let alert = trigger.alert(
            "Manual intervention required",
            format!("playbook '{}' failed: {}", playbook, reason),
        );
        if let Err(e) = self
            .alerts
            .send(&self.config.remediation.alert_channels, &alert)
            .await
        {
            error!(error = %e, "Failed to deliver escalation alert");
        }

        if let Err(e) = self
            .state
            .transition_to(SystemMode::SafeMode, format!("escalated: {}", reason))
        {
            error!(error = %e, "Failed to persist SAFE_MODE");
        }
    }

    /// Lift the command pause this engine applied, once the system is healthy.
    pub async fn on_recovered(&self) {
        if !self.paused.load(Ordering::SeqCst) || self.latch.is_engaged() {
            return;
        }
        match self.bridge.set_command_pause(false).await {
            Ok(()) => {
                self.paused.store(false, Ordering::SeqCst);
                info!("New commands resumed after recovery");
            }
            Err(e) => warn!(error = %e, "Failed to resume commands"),
        }
    }

    /// Resume commands after an operator released the latch.
    pub async fn on_latch_released(&self) {
        match self.bridge.set_command_pause(false).await {
            Ok(()) => {
                self.paused.store(false, Ordering::SeqCst);
                info!("Manual latch released, new commands resumed");
            }
            Err(e) => warn!(error = %e, "Failed to resume commands after latch release"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::paper::{PaperBridge, PaperBroker, RecordingAlertSink};
    use crate::transport::{MessageBuffer, RouterSettings};
    use rust_decimal_macros::dec;

    struct Harness {
        engine: RemediationEngine,
        state: Arc<StateMachine>,
        bridge: Arc<PaperBridge>,
        alerts: Arc<RecordingAlertSink>,
        latch: Arc<ManualLatch>,
        _dir: tempfile::TempDir,
    }

    fn harness(broker: PaperBroker) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let mut config = RemediationConfig::default();
        config.remediation.checkpoint_dir = dir.path().join("checkpoints");
        config.remediation.alert_channels = vec!["pager".to_string(), "chat".to_string()];

        let state = Arc::new(StateMachine::new(SystemMode::Degraded));
        let buffer = Arc::new(MessageBuffer::in_memory().unwrap());
        let router = Arc::new(TransportRouter::new(buffer, RouterSettings::default()));
        let bridge = Arc::new(PaperBridge::new());
        let alerts = Arc::new(RecordingAlertSink::new());
        let latch = Arc::new(ManualLatch::open(dir.path().join("latch.json")).unwrap());

        let engine = RemediationEngine::new(
            Arc::new(config),
            Arc::clone(&state),
            router,
            Arc::new(broker),
            bridge.clone(),
            alerts.clone(),
            Arc::clone(&latch),
        );
        Harness {
            engine,
            state,
            bridge,
            alerts,
            latch,
            _dir: dir,
        }
    }

    fn step(name: &str, action: RemediationAction, secs: u64) -> RemediationStep {
        RemediationStep::new(name, action, Duration::from_secs(secs))
    }

    fn trigger() -> RemediationTrigger {
        RemediationTrigger::new("bridge_latency", SystemMode::Degraded).with_metric("bridge_latency", 900.0)
    }

    #[tokio::test(start_paused = true)]
    async fn test_stalled_step_aborts_and_escalates_once() {
        let h = harness(PaperBroker::new());
        h.bridge.stall_quiesce(Duration::from_secs(120));

        let playbook = RemediationPlaybook {
            name: "bridge_recovery".to_string(),
            max_duration: Duration::from_secs(300),
            steps: vec![
                step("pause", RemediationAction::PauseNewCommands, 5),
                step("quiesce", RemediationAction::QuiesceAtSequenceBoundary, 30),
                step("alert", RemediationAction::SendCriticalAlert, 5),
            ],
        };

        let report = h.engine.run_playbook(&playbook, &trigger()).await;
        assert!(matches!(report.outcome, PlaybookOutcome::Escalated { .. }));
        assert_eq!(report.steps.len(), 2);
        assert!(report.steps[0].succeeded());
        assert_eq!(report.steps[1].error.as_deref(), Some("Timed out after 30s"));
        assert!(report.elapsed < Duration::from_secs(300));

        // One escalation alert, fanned out to both channels by the sink
        let sent = h.alerts.sent();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].0, vec!["pager", "chat"]);
        assert_eq!(sent[0].1.title, "Manual intervention required");
        assert_eq!(sent[0].1.metrics.get("bridge_latency"), Some(&900.0));

        assert!(h.latch.is_engaged());
        assert!(h.bridge.is_paused());
        assert_eq!(h.state.current(), SystemMode::SafeMode);
    }

    #[tokio::test(start_paused = true)]
    async fn test_budget_checked_between_steps() {
        let h = harness(PaperBroker::new());
        h.bridge.stall_quiesce(Duration::from_secs(8));

        let playbook = RemediationPlaybook {
            name: "tight".to_string(),
            max_duration: Duration::from_secs(5),
            steps: vec![
                // Runs past the budget but within its own timeout
                step("quiesce", RemediationAction::QuiesceAtSequenceBoundary, 10),
                step("pause", RemediationAction::PauseNewCommands, 5),
            ],
        };
        let report = h.engine.run_playbook(&playbook, &trigger()).await;
        assert_eq!(report.steps.len(), 1);
        assert!(report.steps[0].succeeded());
        match report.outcome {
            PlaybookOutcome::Escalated { reason } => assert!(reason.contains("time budget")),
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_continue_on_failure_keeps_going() {
        let h = harness(PaperBroker::new());
        h.bridge.fail_agent_restart();

        let playbook = RemediationPlaybook {
            name: "agent".to_string(),
            max_duration: Duration::from_secs(60),
            steps: vec![
                step("restart", RemediationAction::RestartExternalAgent, 5).continue_on_failure(),
                step("pause", RemediationAction::PauseNewCommands, 5),
            ],
        };
        let report = h.engine.run_playbook(&playbook, &trigger()).await;
        assert!(report.is_completed());
        assert!(!report.steps[0].succeeded());
        assert!(report.steps[1].succeeded());
        assert_eq!(h.state.current(), SystemMode::Recovering);
        assert!(h.alerts.sent().is_empty());
        assert!(!h.latch.is_engaged());

        h.engine.on_recovered().await;
        assert!(!h.bridge.is_paused());
        assert!(!h.engine.commands_paused());
    }

    #[tokio::test]
    async fn test_close_all_and_checkpoint_actions() {
        let broker = PaperBroker::new();
        for ticket in 1..=5 {
            broker.open_position(ticket, "EURUSD", crate::types::OrderSide::Buy, dec!(0.1), dec!(1.08));
        }
        broker.reject_graceful_close(5);
        let h = harness(broker);

        h.engine
            .perform(RemediationAction::CreateEmergencyCheckpoint, &trigger())
            .await
            .unwrap();
        h.engine
            .perform(RemediationAction::CloseAllPositionsGracefully, &trigger())
            .await
            .unwrap();
        h.engine
            .perform(RemediationAction::ReconcileWithBrokerTruth, &trigger())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_reconcile_with_open_positions_matching_broker() {
        let broker = PaperBroker::new();
        broker.open_position(1, "EURUSD", crate::types::OrderSide::Buy, dec!(0.1), dec!(1.08));
        broker.open_position(2, "XAUUSD", crate::types::OrderSide::Sell, dec!(0.3), dec!(2400));
        let h = harness(broker);

        h.engine
            .perform(RemediationAction::ReconcileWithBrokerTruth, &trigger())
            .await
            .unwrap();
        assert!(h.engine.reconciler().halted_symbols().await.is_empty());
        assert_eq!(
            h.engine.reconciler().get_local_position("EURUSD").await,
            dec!(0.1)
        );
    }

    #[tokio::test]
    async fn test_close_all_keeps_seeded_book_in_step() {
        let broker = PaperBroker::new();
        broker.open_position(1, "EURUSD", crate::types::OrderSide::Buy, dec!(0.1), dec!(1.08));
        broker.open_position(2, "EURUSD", crate::types::OrderSide::Buy, dec!(0.2), dec!(1.08));
        let h = harness(broker);
        h.engine.reconciler().initialize_from_broker().await.unwrap();

        h.engine
            .perform(RemediationAction::CloseAllPositionsGracefully, &trigger())
            .await
            .unwrap();
        assert_eq!(
            h.engine.reconciler().get_local_position("EURUSD").await,
            dec!(0)
        );
        h.engine
            .perform(RemediationAction::ReconcileWithBrokerTruth, &trigger())
            .await
            .unwrap();
        assert!(h.engine.reconciler().halted_symbols().await.is_empty());
    }
}
