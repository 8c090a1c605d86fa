//! # Orchestrator
//!
//! The single control loop. Each tick it runs the health checks, lets the
//! state machine aggregate them, and on a degrading transition hands the
//! matching playbook to the remediation engine.
//!
//! All process-wide flags (latch state, emergency mode, recovery history)
//! are fields here; nothing in the crate keeps them in statics.
//!
//! While the manual latch is engaged the checks keep running and the status
//! endpoint stays current, but no transition is applied and no playbook runs.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::alerts::AlertSink;
use crate::bridge::BridgeManager;
use crate::broker::Broker;
use crate::config::{EndpointKind, RemediationConfig};
use crate::error::ResilienceError;
use crate::feed::MarketFeed;
use crate::health::server::{BreakerStatus, HealthState, StatusSnapshot};
use crate::health::{HealthMetric, HealthMonitor, HealthStatus, ProbeSet};
use crate::remediation::{
    ManualLatch, PlaybookOutcome, RemediationEngine, RemediationPlaybook, RemediationTrigger,
};
use crate::resilience::BreakerSettings;
use crate::state::{ModeStore, ModeTransition, StateMachine, SystemMode};
use crate::transport::{
    MessageBuffer, RouterSettings, SocketTransport, SpoolTransport, TransportRouter,
};

/// External systems the control loop acts on.
#[derive(Clone)]
pub struct Collaborators {
    pub broker: Arc<dyn Broker>,
    pub bridge: Arc<dyn BridgeManager>,
    pub feed: Arc<dyn MarketFeed>,
    pub alerts: Arc<dyn AlertSink>,
}

/// One remediation run, kept for operators.
#[derive(Debug, Clone, PartialEq)]
pub struct RecoveryRecord {
    pub trigger: String,
    pub playbook: String,
    pub outcome: PlaybookOutcome,
    pub started_at: DateTime<Utc>,
    pub duration: Duration,
}

/// Result of one control-loop tick.
#[derive(Debug, Clone)]
pub struct TickReport {
    pub metrics: Vec<HealthMetric>,
    pub transition: Option<ModeTransition>,
    pub remediation: Option<RecoveryRecord>,
    /// Set when the latch suppressed transitions and remediation
    pub latched: bool,
}

/// Router settings derived from the configuration document.
pub fn router_settings(config: &RemediationConfig) -> RouterSettings {
    RouterSettings {
        send_timeout: config.transports.send_timeout,
        breaker: BreakerSettings::from(config.breakers.system_wide),
        latency_improvement: config.transports.latency_improvement,
        quiesce_timeout: config.remediation.quiesce_timeout,
        recovery_backoff: config.transports.recovery.backoff(),
        recovery_interval: config.transports.recovery.interval,
        replay_interval: config.buffer.replay_interval,
    }
}

/// Open the buffer and register every configured transport.
pub fn build_router(
    config: &RemediationConfig,
    bridge: Arc<dyn BridgeManager>,
) -> Result<Arc<TransportRouter>, ResilienceError> {
    let buffer = MessageBuffer::open(&config.buffer.path)?
        .with_ttl(config.buffer.ttl)
        .with_batch_size(config.buffer.batch_size);
    let router =
        TransportRouter::new(Arc::new(buffer), router_settings(config)).with_bridge(bridge);

    for endpoint in &config.transports.endpoints {
        match endpoint.kind {
            EndpointKind::Socket => {
                let address = endpoint.address.clone().unwrap_or_default();
                router.add_transport(
                    Arc::new(SocketTransport::new(
                        &endpoint.name,
                        address,
                        config.transports.send_timeout,
                    )),
                    endpoint.primary,
                );
            }
            EndpointKind::Spool => {
                let root = endpoint.root.clone().unwrap_or_default();
                router.add_transport(
                    Arc::new(SpoolTransport::new(&endpoint.name, root)?),
                    endpoint.primary,
                );
            }
        }
        info!(transport = %endpoint.name, kind = ?endpoint.kind, "Transport registered");
    }
    router.set_preferred(config.transports.preferred.clone());
    Ok(Arc::new(router))
}

pub struct Orchestrator {
    config: Arc<RemediationConfig>,
    monitor: HealthMonitor,
    state: Arc<StateMachine>,
    remediation: RemediationEngine,
    router: Arc<TransportRouter>,
    latch: Arc<ManualLatch>,
    emergency_mode: bool,
    recovery_history: VecDeque<RecoveryRecord>,
    /// Source of the trigger whose playbook last ran, until the system recovers
    active_trigger: Option<String>,
    health: Option<HealthState>,
    started: Instant,
}

impl Orchestrator {
    /// Wire the loop with the built-in probes.
    pub fn new(
        config: Arc<RemediationConfig>,
        router: Arc<TransportRouter>,
        collaborators: Collaborators,
    ) -> Result<Self, ResilienceError> {
        let probes = ProbeSet::standard(
            Arc::clone(&router),
            Arc::clone(&collaborators.broker),
            Arc::clone(&collaborators.bridge),
            Arc::clone(&collaborators.feed),
        );
        Self::with_probes(config, router, collaborators, &probes)
    }

    pub fn with_probes(
        config: Arc<RemediationConfig>,
        router: Arc<TransportRouter>,
        collaborators: Collaborators,
        probes: &ProbeSet,
    ) -> Result<Self, ResilienceError> {
        let state = Arc::new(StateMachine::with_store(ModeStore::new(
            config.state.mode_path.clone(),
        ))?);
        let latch = Arc::new(ManualLatch::open(config.remediation.latch_path.clone())?);
        let monitor = HealthMonitor::new(&config, probes)?;
        let remediation = RemediationEngine::new(
            Arc::clone(&config),
            Arc::clone(&state),
            Arc::clone(&router),
            collaborators.broker,
            collaborators.bridge,
            collaborators.alerts,
            Arc::clone(&latch),
        );
        let emergency_mode = latch.is_engaged();

        Ok(Self {
            config,
            monitor,
            state,
            remediation,
            router,
            latch,
            emergency_mode,
            recovery_history: VecDeque::new(),
            active_trigger: None,
            health: None,
            started: Instant::now(),
        })
    }

    /// Publish a status snapshot into `health` after every tick.
    #[must_use]
    pub fn with_health_state(mut self, health: HealthState) -> Self {
        self.health = Some(health);
        self
    }

    pub fn mode(&self) -> SystemMode {
        self.state.current()
    }

    pub fn state(&self) -> &Arc<StateMachine> {
        &self.state
    }

    pub fn router(&self) -> &Arc<TransportRouter> {
        &self.router
    }

    pub fn remediation(&self) -> &RemediationEngine {
        &self.remediation
    }

    pub fn latch(&self) -> &Arc<ManualLatch> {
        &self.latch
    }

    pub fn is_emergency(&self) -> bool {
        self.emergency_mode
    }

    pub fn recovery_history(&self) -> impl Iterator<Item = &RecoveryRecord> {
        self.recovery_history.iter()
    }

    /// One pass of the control loop.
    pub async fn tick(&mut self) -> TickReport {
        if self.latch.is_engaged() && self.latch.refresh_from_disk() {
            self.emergency_mode = false;
            self.active_trigger = None;
            self.remediation.on_latch_released().await;
        }

        let metrics = self.monitor.run_tick().await;

        if self.latch.is_engaged() {
            self.emergency_mode = true;
            debug!("Manual latch engaged, skipping transitions and remediation");
            self.publish(&metrics).await;
            return TickReport {
                metrics,
                transition: None,
                remediation: None,
                latched: true,
            };
        }

        let transition = match self.state.evaluate(&metrics) {
            Ok(t) => t,
            Err(e) => {
                error!(error = %e, "Failed to persist mode transition");
                None
            }
        };

        let mut remediation = None;
        if let Some(t) = &transition {
            if t.is_degrading() {
                remediation = self.remediate(t, &metrics).await;
            } else if t.is_recovery() {
                self.active_trigger = None;
                self.remediation.on_recovered().await;
            }
        }

        self.publish(&metrics).await;
        TickReport {
            metrics,
            transition,
            remediation,
            latched: false,
        }
    }

    /// Playbook bound to the worst check that names one, else the mode's
    /// fallback.
    fn select_playbook(
        &self,
        transition: &ModeTransition,
        metrics: &[HealthMetric],
    ) -> Option<(RemediationPlaybook, RemediationTrigger)> {
        for wanted in [HealthStatus::Critical, HealthStatus::Degraded] {
            for metric in metrics.iter().filter(|m| m.status == wanted) {
                let bound = self
                    .monitor
                    .check_config(&metric.name)
                    .and_then(|c| c.playbook.as_deref())
                    .and_then(|name| self.config.playbook(name));
                if let Some(playbook) = bound {
                    return Some((playbook, self.trigger(&metric.name, transition.to, metrics)));
                }
            }
        }

        let name = self.config.mode_playbook(transition.to)?;
        let playbook = self.config.playbook(name)?;
        Some((
            playbook,
            self.trigger(&format!("mode:{}", transition.to), transition.to, metrics),
        ))
    }

    fn trigger(&self, source: &str, mode: SystemMode, metrics: &[HealthMetric]) -> RemediationTrigger {
        metrics
            .iter()
            .filter(|m| matches!(m.status, HealthStatus::Degraded | HealthStatus::Critical))
            .fold(RemediationTrigger::new(source, mode), |t, m| {
                t.with_metric(m.name.clone(), m.value)
            })
    }

    async fn remediate(
        &mut self,
        transition: &ModeTransition,
        metrics: &[HealthMetric],
    ) -> Option<RecoveryRecord> {
        let Some((playbook, trigger)) = self.select_playbook(transition, metrics) else {
            warn!(mode = %transition.to, reason = %transition.reason, "No playbook bound to degrading transition");
            return None;
        };
        // Same fault still open after its playbook ran: hold in the new mode
        // instead of running the playbook again every tick
        if transition.from == SystemMode::Recovering
            && self.active_trigger.as_deref() == Some(trigger.source.as_str())
        {
            info!(
                trigger = %trigger.source,
                playbook = %playbook.name,
                mode = %transition.to,
                "Playbook already ran for this trigger, waiting for recovery"
            );
            return None;
        }

        let started_at = Utc::now();
        let report = self.remediation.run_playbook(&playbook, &trigger).await;
        if !report.is_completed() {
            self.emergency_mode = true;
        }

        self.active_trigger = Some(trigger.source.clone());
        let record = RecoveryRecord {
            trigger: trigger.source,
            playbook: report.playbook,
            outcome: report.outcome,
            started_at,
            duration: report.elapsed,
        };
        self.recovery_history.push_back(record.clone());
        while self.recovery_history.len() > self.config.remediation.history_limit {
            self.recovery_history.pop_front();
        }
        Some(record)
    }

    async fn publish(&self, metrics: &[HealthMetric]) {
        let Some(health) = &self.health else {
            return;
        };
        let buffer = match self.router.buffer().stats().await {
            Ok(stats) => Some(stats),
            Err(e) => {
                warn!(error = %e, "Buffer stats unavailable for status snapshot");
                None
            }
        };
        let snapshot = StatusSnapshot {
            mode: self.state.current(),
            latch_engaged: self.latch.is_engaged(),
            checks: metrics.to_vec(),
            breakers: self
                .monitor
                .breaker_states()
                .into_iter()
                .map(|(name, state)| BreakerStatus { name, state })
                .collect(),
            transports: self.router.status(),
            buffer,
            uptime_seconds: self.started.elapsed().as_secs(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            timestamp: Utc::now(),
        };
        *health.write().await = snapshot;
    }

    /// Run until `shutdown` fires, then stop and join the router's
    /// background tasks.
    pub async fn run(mut self, shutdown: CancellationToken) {
        if let Err(e) = self.remediation.reconciler().initialize_from_broker().await {
            warn!(error = %e, "Position book not seeded at startup, first reconcile will seed it");
        }
        let router_tasks = self.router.start();
        let mut ticker = tokio::time::interval(self.config.monitor.tick_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            interval = ?self.config.monitor.tick_interval,
            checks = self.monitor.check_names().len(),
            mode = %self.state.current(),
            latch = self.latch.is_engaged(),
            "Control loop started"
        );

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = ticker.tick() => {
                    let report = self.tick().await;
                    if let Some(t) = &report.transition {
                        info!(from = %t.from, to = %t.to, "Tick changed system mode");
                    }
                }
            }
        }

        info!("Control loop stopping");
        router_tasks.shutdown().await;
        info!(history = self.recovery_history.len(), "Control loop stopped");
    }
}
