//! Priority-ordered failover across transports.
//!
//! `send_with_failover` tries the primary first, then every other transport
//! in registration order, skipping any that report themselves disconnected
//! or whose breaker is open. When all of them fail the message goes to the
//! [`MessageBuffer`] and the call returns [`DeliveryOutcome::Buffered`].
//!
//! Two supervised background tasks run beside the router:
//! - recovery: re-establishes disconnected transports with jittered
//!   exponential backoff and restores the preferred transport as primary
//!   when it is measurably faster
//! - replay: periodically resubmits buffered messages and purges dead rows
//!
//! Both are owned by a [`RouterHandle`] and joined on shutdown, so nothing
//! writes to the buffer after the process starts tearing it down.

use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use super::buffer::{BufferError, MessageBuffer};
use super::{Transport, TransportError, TransportHealth, TransportMessage};
use crate::bridge::{BridgeError, BridgeManager};
use crate::logging::RouterLogThrottler;
use crate::metrics;
use crate::resilience::{BackoffPolicy, BreakerError, BreakerSettings, CircuitBreaker, CircuitState};

/// Where a message ended up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DeliveryOutcome {
    /// Accepted by the named transport
    Delivered(String),
    /// Written to the store-and-forward buffer
    Buffered,
}

impl DeliveryOutcome {
    pub fn is_delivered(&self) -> bool {
        matches!(self, DeliveryOutcome::Delivered(_))
    }
}

impl std::fmt::Display for DeliveryOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DeliveryOutcome::Delivered(name) => f.write_str(name),
            DeliveryOutcome::Buffered => f.write_str("buffered"),
        }
    }
}

#[derive(Error, Debug)]
pub enum SwitchError {
    #[error("Quiesce before switch failed: {0}")]
    Quiesce(#[from] BridgeError),

    #[error("Quiesce before switch timed out after {0:?}")]
    QuiesceTimeout(Duration),

    #[error("Unknown transport '{0}'")]
    UnknownTransport(String),

    #[error("No reachable alternative transport")]
    NoCandidate,

    #[error("Latency probe failed: {0}")]
    Probe(#[from] TransportError),
}

/// Snapshot of one registered transport.
#[derive(Debug, Clone, serde::Serialize)]
pub struct RouteStatus {
    pub health: TransportHealth,
    pub breaker: CircuitState,
    pub primary: bool,
}

#[derive(Clone)]
struct Route {
    transport: Arc<dyn Transport>,
    breaker: Arc<CircuitBreaker>,
}

impl Route {
    fn name(&self) -> &str {
        self.transport.name()
    }
}

/// Tunables for the router and its background tasks.
#[derive(Debug, Clone)]
pub struct RouterSettings {
    pub send_timeout: Duration,
    pub breaker: BreakerSettings,
    /// Candidate must measure below `ratio * current` latency to take over
    pub latency_improvement: f64,
    pub quiesce_timeout: Duration,
    pub recovery_backoff: BackoffPolicy,
    /// Pause between recovery checks when nothing is down
    pub recovery_interval: Duration,
    pub replay_interval: Duration,
}

impl Default for RouterSettings {
    fn default() -> Self {
        Self {
            send_timeout: Duration::from_secs(5),
            breaker: BreakerSettings::default(),
            latency_improvement: 0.8,
            quiesce_timeout: Duration::from_secs(30),
            recovery_backoff: BackoffPolicy::default(),
            recovery_interval: Duration::from_secs(30),
            replay_interval: Duration::from_secs(15),
        }
    }
}

pub struct TransportRouter {
    routes: RwLock<Vec<Route>>,
    primary: RwLock<Option<String>>,
    preferred: RwLock<Option<String>>,
    buffer: Arc<MessageBuffer>,
    bridge: Option<Arc<dyn BridgeManager>>,
    settings: RouterSettings,
    throttle: Mutex<RouterLogThrottler>,
}

enum RecoveryPass {
    Idle,
    Recovered,
    Failed,
}

impl TransportRouter {
    pub fn new(buffer: Arc<MessageBuffer>, settings: RouterSettings) -> Self {
        Self {
            routes: RwLock::new(Vec::new()),
            primary: RwLock::new(None),
            preferred: RwLock::new(None),
            buffer,
            bridge: None,
            settings,
            throttle: Mutex::new(RouterLogThrottler::default()),
        }
    }

    /// Bridge manager quiesced before any primary switch.
    #[must_use]
    pub fn with_bridge(mut self, bridge: Arc<dyn BridgeManager>) -> Self {
        self.bridge = Some(bridge);
        self
    }

    pub fn buffer(&self) -> &Arc<MessageBuffer> {
        &self.buffer
    }

    pub fn settings(&self) -> &RouterSettings {
        &self.settings
    }

    /// Register a transport. The first registration, or any explicitly
    /// marked one, becomes primary.
    pub fn add_transport(&self, transport: Arc<dyn Transport>, is_primary: bool) {
        let name = transport.name().to_string();
        let breaker = Arc::new(CircuitBreaker::new(
            format!("transport:{}", name),
            self.settings.breaker,
        ));
        write(&self.routes).push(Route { transport, breaker });

        let mut primary = write(&self.primary);
        if is_primary || primary.is_none() {
            *primary = Some(name.clone());
        }
        info!(transport = %name, primary = is_primary, "Transport registered");
    }

    /// Transport the recovery task restores as primary when it is faster.
    pub fn set_preferred(&self, name: Option<String>) {
        *write(&self.preferred) = name;
    }

    pub fn primary(&self) -> Option<String> {
        read(&self.primary).clone()
    }

    /// Make `name` primary without probing or quiescing.
    pub fn set_primary(&self, name: &str) -> bool {
        if !read(&self.routes).iter().any(|r| r.name() == name) {
            return false;
        }
        *write(&self.primary) = Some(name.to_string());
        true
    }

    pub fn transport_names(&self) -> Vec<String> {
        read(&self.routes).iter().map(|r| r.name().to_string()).collect()
    }

    pub fn status(&self) -> Vec<RouteStatus> {
        let primary = self.primary();
        self.ordered_routes()
            .into_iter()
            .map(|r| RouteStatus {
                health: r.transport.health(),
                breaker: r.breaker.get_state(),
                primary: primary.as_deref() == Some(r.name()),
            })
            .collect()
    }

    /// Primary first, then the rest in registration order.
    fn ordered_routes(&self) -> Vec<Route> {
        let routes = read(&self.routes).clone();
        let primary = self.primary();
        let (mut first, rest): (Vec<Route>, Vec<Route>) = routes
            .into_iter()
            .partition(|r| primary.as_deref() == Some(r.name()));
        first.extend(rest);
        first
    }

    fn route(&self, name: &str) -> Option<Route> {
        read(&self.routes).iter().find(|r| r.name() == name).cloned()
    }

    /// Deliver `message` on the first transport that accepts it, or buffer it.
    ///
    /// Only a failure to write the buffer is an error; transport failures are
    /// absorbed by failover.
    pub async fn send_with_failover(
        &self,
        message: &TransportMessage,
    ) -> Result<DeliveryOutcome, BufferError> {
        let mut last_tried: Option<String> = None;

        for route in self.ordered_routes() {
            let name = route.name().to_string();
            if !route.transport.health().connected {
                debug!(transport = %name, msg_id = %message.msg_id, "Skipping disconnected transport");
                continue;
            }

            let timeout = self.settings.send_timeout;
            let transport = Arc::clone(&route.transport);
            let attempt = route
                .breaker
                .call(|| async move {
                    tokio::time::timeout(timeout, transport.send(message))
                        .await
                        .unwrap_or_else(|_| {
                            Err(TransportError::Timeout {
                                transport: transport.name().to_string(),
                                after: timeout,
                            })
                        })
                })
                .await;

            match attempt {
                Ok(()) => {
                    metrics::record_send(&name, true);
                    if let Err(e) = self.buffer.mark_acknowledged(&message.msg_id).await {
                        warn!(msg_id = %message.msg_id, error = %e, "Delivered but failed to mark buffered copy acknowledged");
                    }
                    debug!(transport = %name, msg_id = %message.msg_id, "Message delivered");
                    return Ok(DeliveryOutcome::Delivered(name));
                }
                Err(BreakerError::Open { .. }) => {
                    debug!(transport = %name, msg_id = %message.msg_id, "Skipping transport with open breaker");
                }
                Err(BreakerError::Inner(e)) => {
                    metrics::record_send(&name, false);
                    self.log_send_failure(&name, &message.msg_id, &e);
                    last_tried = Some(name);
                }
            }
        }

        self.buffer.buffer(message, last_tried.as_deref()).await?;
        warn!(
            msg_id = %message.msg_id,
            msg_type = %message.msg_type,
            "All transports failed, message buffered"
        );
        Ok(DeliveryOutcome::Buffered)
    }

    fn log_send_failure(&self, transport: &str, msg_id: &str, err: &TransportError) {
        let mut throttle = self.throttle.lock().unwrap_or_else(|e| e.into_inner());
        if throttle.send_failure.should_log() {
            let suppressed = throttle.send_failure.get_and_reset_suppressed_count();
            warn!(
                transport = %transport,
                msg_id = %msg_id,
                kind = %err.kind(),
                error = %err,
                suppressed,
                "Transport send failed, failing over"
            );
        }
    }

    /// Reset every transport, primary first. Returns the per-transport result.
    pub async fn reset_all_in_priority_order(&self) -> Vec<(String, Result<(), TransportError>)> {
        let mut results = Vec::new();
        for route in self.ordered_routes() {
            let result = route.transport.reset().await;
            match &result {
                Ok(()) => {
                    route.breaker.reset();
                    info!(transport = %route.name(), "Transport reset");
                }
                Err(e) => warn!(transport = %route.name(), error = %e, "Transport reset failed"),
            }
            results.push((route.name().to_string(), result));
        }
        results
    }

    async fn quiesce(&self) -> Result<(), SwitchError> {
        let Some(bridge) = &self.bridge else {
            return Ok(());
        };
        match tokio::time::timeout(
            self.settings.quiesce_timeout,
            bridge.quiesce_at_sequence_boundary(),
        )
        .await
        {
            Ok(result) => Ok(result?),
            Err(_) => Err(SwitchError::QuiesceTimeout(self.settings.quiesce_timeout)),
        }
    }

    async fn probe(&self, route: &Route) -> Result<f64, TransportError> {
        let timeout = self.settings.send_timeout;
        match tokio::time::timeout(timeout, route.transport.probe_latency()).await {
            Ok(result) => result.map(|d| d.as_secs_f64() * 1000.0),
            Err(_) => Err(TransportError::Timeout {
                transport: route.name().to_string(),
                after: timeout,
            }),
        }
    }

    /// Round-trip latency of the current primary, in milliseconds.
    pub async fn probe_primary_latency(&self) -> Result<f64, TransportError> {
        let primary = self.primary().and_then(|p| self.route(&p));
        let Some(route) = primary else {
            return Err(TransportError::Connectivity {
                transport: "primary".to_string(),
                reason: "no transport registered".to_string(),
            });
        };
        self.probe(&route).await
    }

    fn is_better(&self, candidate_ms: f64, current_ms: Option<f64>) -> bool {
        match current_ms {
            Some(current) => candidate_ms < current * self.settings.latency_improvement,
            // Current primary unreachable
            None => true,
        }
    }

    async fn commit_primary(&self, name: &str) {
        let previous = self.primary();
        *write(&self.primary) = Some(name.to_string());
        if let Some(bridge) = &self.bridge {
            if let Err(e) = bridge.set_primary_bridge(name).await {
                warn!(transport = %name, error = %e, "Bridge manager did not accept primary change");
            }
        }
        info!(from = ?previous, to = %name, "Primary transport switched");
    }

    /// Switch primary to `candidate` if it is meaningfully faster.
    ///
    /// Commands are quiesced before the latency probe. Returns `Ok(false)`
    /// when the candidate is not fast enough.
    pub async fn try_switch_primary(&self, candidate: &str) -> Result<bool, SwitchError> {
        let route = self
            .route(candidate)
            .ok_or_else(|| SwitchError::UnknownTransport(candidate.to_string()))?;
        if self.primary().as_deref() == Some(candidate) {
            return Ok(false);
        }

        self.quiesce().await?;

        let candidate_ms = self.probe(&route).await?;
        let current_ms = match self.primary().and_then(|p| self.route(&p)) {
            Some(current) => self.probe(&current).await.ok(),
            None => None,
        };

        if !self.is_better(candidate_ms, current_ms) {
            debug!(
                candidate = %candidate,
                candidate_ms,
                current_ms = ?current_ms,
                "Candidate transport not fast enough to switch"
            );
            return Ok(false);
        }

        self.commit_primary(candidate).await;
        Ok(true)
    }

    /// Move primary to the fastest reachable alternative.
    ///
    /// Used by remediation when the current primary is misbehaving. The
    /// latency-improvement rule still applies while the primary answers
    /// probes.
    pub async fn switch_to_fastest(&self) -> Result<Option<String>, SwitchError> {
        self.quiesce().await?;

        let primary = self.primary();
        let mut current_ms = None;
        let mut best: Option<(String, f64)> = None;
        for route in self.ordered_routes() {
            if !route.transport.health().connected && route.transport.reset().await.is_err() {
                continue;
            }
            let Ok(ms) = self.probe(&route).await else {
                continue;
            };
            if primary.as_deref() == Some(route.name()) {
                current_ms = Some(ms);
            } else if best.as_ref().map_or(true, |(_, b)| ms < *b) {
                best = Some((route.name().to_string(), ms));
            }
        }

        let (name, ms) = best.ok_or(SwitchError::NoCandidate)?;
        if !self.is_better(ms, current_ms) {
            return Ok(None);
        }
        self.commit_primary(&name).await;
        Ok(Some(name))
    }

    async fn recovery_pass(&self) -> RecoveryPass {
        let mut failed = false;
        let mut recovered = false;

        let down: Vec<Route> = self
            .ordered_routes()
            .into_iter()
            .filter(|r| !r.transport.health().connected)
            .collect();
        if !down.is_empty() {
            // In-flight commands finish before any link is torn down
            if let Err(e) = self.quiesce().await {
                warn!(transports = down.len(), error = %e, "Quiesce before transport reset failed, reset skipped");
                return RecoveryPass::Failed;
            }
        }

        for route in down {
            match route.transport.reset().await {
                Ok(()) => {
                    recovered = true;
                    info!(transport = %route.name(), "Transport reconnected");
                }
                Err(e) => {
                    failed = true;
                    let mut throttle = self.throttle.lock().unwrap_or_else(|e| e.into_inner());
                    if throttle.recovery_attempt.should_log() {
                        let suppressed = throttle.recovery_attempt.get_and_reset_suppressed_count();
                        debug!(transport = %route.name(), error = %e, suppressed, "Transport still down");
                    }
                }
            }
        }

        let preferred = read(&self.preferred).clone();
        if let Some(preferred) = preferred {
            let connected = self
                .route(&preferred)
                .is_some_and(|r| r.transport.health().connected);
            if connected && self.primary().as_deref() != Some(preferred.as_str()) {
                match self.try_switch_primary(&preferred).await {
                    Ok(true) => recovered = true,
                    Ok(false) => {}
                    Err(e) => {
                        failed = true;
                        warn!(transport = %preferred, error = %e, "Restoring preferred transport failed");
                    }
                }
            }
        }

        if failed {
            RecoveryPass::Failed
        } else if recovered {
            RecoveryPass::Recovered
        } else {
            RecoveryPass::Idle
        }
    }

    async fn run_recovery(self: Arc<Self>, shutdown: CancellationToken) {
        let mut attempt: u32 = 0;
        loop {
            let delay = if attempt == 0 {
                self.settings.recovery_interval
            } else {
                self.settings.recovery_backoff.delay(attempt - 1)
            };
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
            match self.recovery_pass().await {
                RecoveryPass::Failed => attempt = attempt.saturating_add(1),
                RecoveryPass::Recovered | RecoveryPass::Idle => attempt = 0,
            }
        }
        debug!("Transport recovery task stopped");
    }

    async fn run_replay(self: Arc<Self>, shutdown: CancellationToken) {
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.settings.replay_interval) => {}
            }
            let result = async {
                let report = self.buffer.replay(&self).await?;
                self.buffer.purge().await?;
                Ok::<_, BufferError>(report)
            }
            .await;
            if let Err(e) = result {
                let mut throttle = self.throttle.lock().unwrap_or_else(|e| e.into_inner());
                if throttle.replay_failure.should_log() {
                    let suppressed = throttle.replay_failure.get_and_reset_suppressed_count();
                    error!(error = %e, suppressed, "Buffer replay failed");
                }
            }
        }
        debug!("Buffer replay task stopped");
    }

    /// Spawn the recovery and replay tasks.
    pub fn start(self: &Arc<Self>) -> RouterHandle {
        let shutdown = CancellationToken::new();
        let tasks = vec![
            tokio::spawn(Arc::clone(self).run_recovery(shutdown.child_token())),
            tokio::spawn(Arc::clone(self).run_replay(shutdown.child_token())),
        ];
        info!("Transport router background tasks started");
        RouterHandle { shutdown, tasks }
    }
}

/// Ownership of the router's background tasks.
pub struct RouterHandle {
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl RouterHandle {
    /// Cancel both tasks and wait for them to exit.
    pub async fn shutdown(self) {
        self.shutdown.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                error!(error = %e, "Router background task panicked");
            }
        }
        info!("Transport router background tasks joined");
    }
}

fn read<T>(lock: &RwLock<T>) -> std::sync::RwLockReadGuard<'_, T> {
    lock.read().unwrap_or_else(|e| e.into_inner())
}

fn write<T>(lock: &RwLock<T>) -> std::sync::RwLockWriteGuard<'_, T> {
    lock.write().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

    /// In-process transport with a switchable outage and fixed latency.
    struct FakeTransport {
        name: String,
        up: AtomicBool,
        connected: AtomicBool,
        latency_ms: AtomicU64,
        sent: AtomicU64,
        resets: AtomicU64,
    }

    impl FakeTransport {
        fn new(name: &str, up: bool, latency_ms: u64) -> Arc<Self> {
            Arc::new(Self {
                name: name.to_string(),
                up: AtomicBool::new(up),
                connected: AtomicBool::new(true),
                latency_ms: AtomicU64::new(latency_ms),
                sent: AtomicU64::new(0),
                resets: AtomicU64::new(0),
            })
        }

        /// Reachable, but reporting its session as dropped until reset.
        fn disconnected(name: &str, latency_ms: u64) -> Arc<Self> {
            let transport = Self::new(name, true, latency_ms);
            transport.connected.store(false, Ordering::SeqCst);
            transport
        }

        fn down(&self) -> TransportError {
            TransportError::Connectivity {
                transport: self.name.clone(),
                reason: "down".into(),
            }
        }
    }

    #[async_trait]
    impl Transport for FakeTransport {
        fn name(&self) -> &str {
            &self.name
        }

        async fn send(&self, _message: &TransportMessage) -> Result<(), TransportError> {
            if self.up.load(Ordering::SeqCst) {
                self.sent.fetch_add(1, Ordering::SeqCst);
                Ok(())
            } else {
                Err(self.down())
            }
        }

        fn health(&self) -> TransportHealth {
            TransportHealth {
                name: self.name.clone(),
                connected: self.connected.load(Ordering::SeqCst),
                messages_sent: self.sent.load(Ordering::SeqCst),
                messages_received: 0,
                last_error: None,
                latency_samples: Vec::new(),
            }
        }

        async fn reset(&self) -> Result<(), TransportError> {
            self.resets.fetch_add(1, Ordering::SeqCst);
            if self.up.load(Ordering::SeqCst) {
                self.connected.store(true, Ordering::SeqCst);
                Ok(())
            } else {
                Err(self.down())
            }
        }

        async fn probe_latency(&self) -> Result<Duration, TransportError> {
            if self.up.load(Ordering::SeqCst) {
                Ok(Duration::from_millis(self.latency_ms.load(Ordering::SeqCst)))
            } else {
                Err(self.down())
            }
        }
    }

    fn router() -> TransportRouter {
        TransportRouter::new(
            Arc::new(MessageBuffer::in_memory().unwrap()),
            RouterSettings::default(),
        )
    }

    #[tokio::test]
    async fn test_first_registration_is_primary_unless_marked() {
        let router = router();
        router.add_transport(FakeTransport::new("a", true, 10), false);
        router.add_transport(FakeTransport::new("b", true, 10), false);
        assert_eq!(router.primary().as_deref(), Some("a"));
        router.add_transport(FakeTransport::new("c", true, 10), true);
        assert_eq!(router.primary().as_deref(), Some("c"));
        assert_eq!(router.transport_names(), vec!["a", "b", "c"]);
    }

    #[tokio::test]
    async fn test_primary_tried_first() {
        let router = router();
        let a = FakeTransport::new("a", true, 10);
        let b = FakeTransport::new("b", true, 10);
        router.add_transport(a.clone(), false);
        router.add_transport(b.clone(), true);

        let msg = TransportMessage::new("order", json!({}));
        let outcome = router.send_with_failover(&msg).await.unwrap();
        assert_eq!(outcome, DeliveryOutcome::Delivered("b".into()));
        assert_eq!(a.sent.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn test_delivery_acknowledges_buffered_copy() {
        let router = router();
        let a = FakeTransport::new("a", false, 10);
        router.add_transport(a.clone(), true);

        let msg = TransportMessage::new("order", json!({"n": 1}));
        assert_eq!(router.send_with_failover(&msg).await.unwrap().to_string(), "buffered");
        assert!(!router.buffer().get(&msg.msg_id).await.unwrap().unwrap().ack_received);

        a.up.store(true, Ordering::SeqCst);
        assert!(router.send_with_failover(&msg).await.unwrap().is_delivered());
        assert!(router.buffer().get(&msg.msg_id).await.unwrap().unwrap().ack_received);
    }

    #[tokio::test]
    async fn test_switch_requires_meaningful_improvement() {
        let router = router();
        let slow = FakeTransport::new("slow", true, 100);
        let close = FakeTransport::new("close", true, 85);
        let fast = FakeTransport::new("fast", true, 50);
        router.add_transport(slow, true);
        router.add_transport(close, false);
        router.add_transport(fast, false);

        // 85ms is not below 0.8 * 100ms
        assert!(!router.try_switch_primary("close").await.unwrap());
        assert_eq!(router.primary().as_deref(), Some("slow"));

        assert!(router.try_switch_primary("fast").await.unwrap());
        assert_eq!(router.primary().as_deref(), Some("fast"));

        assert!(matches!(
            router.try_switch_primary("nope").await,
            Err(SwitchError::UnknownTransport(_))
        ));
    }

    #[tokio::test]
    async fn test_switch_to_fastest_when_primary_is_down() {
        let router = router();
        let primary = FakeTransport::new("primary", false, 10);
        router.add_transport(primary, true);
        router.add_transport(FakeTransport::new("b", true, 40), false);
        router.add_transport(FakeTransport::new("c", true, 20), false);

        let switched = router.switch_to_fastest().await.unwrap();
        assert_eq!(switched.as_deref(), Some("c"));
        assert_eq!(router.primary().as_deref(), Some("c"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_background_tasks_join_on_shutdown() {
        let router = Arc::new(router());
        router.add_transport(FakeTransport::new("a", true, 10), true);
        let handle = router.start();
        tokio::time::advance(Duration::from_secs(60)).await;
        handle.shutdown().await;
    }

    #[tokio::test]
    async fn test_disconnected_transport_is_skipped() {
        let router = router();
        let a = FakeTransport::disconnected("a", 10);
        let b = FakeTransport::new("b", true, 10);
        router.add_transport(a.clone(), true);
        router.add_transport(b.clone(), false);

        let msg = TransportMessage::new("order", json!({"n": 1}));
        let outcome = router.send_with_failover(&msg).await.unwrap();
        assert_eq!(outcome, DeliveryOutcome::Delivered("b".into()));
        assert_eq!(a.sent.load(Ordering::SeqCst), 0);
        assert_eq!(b.sent.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_recovery_quiesces_then_reconnects() {
        let bridge = Arc::new(crate::paper::PaperBridge::new());
        bridge.set_pending(3);
        let router = router().with_bridge(bridge.clone());
        let a = FakeTransport::disconnected("a", 10);
        let b = FakeTransport::new("b", true, 10);
        router.add_transport(a.clone(), true);
        router.add_transport(b.clone(), false);

        assert!(matches!(router.recovery_pass().await, RecoveryPass::Recovered));
        assert_eq!(bridge.get_pending_commands().await.unwrap(), 0);
        assert_eq!(a.resets.load(Ordering::SeqCst), 1);
        assert_eq!(b.resets.load(Ordering::SeqCst), 0);
        assert!(a.health().connected);

        // Nothing left down: no reset, no quiesce
        assert!(matches!(router.recovery_pass().await, RecoveryPass::Idle));
        assert_eq!(a.resets.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_skips_reset_when_quiesce_stalls() {
        let bridge = Arc::new(crate::paper::PaperBridge::new());
        bridge.stall_quiesce(Duration::from_secs(600));
        let router = router().with_bridge(bridge);
        let a = FakeTransport::disconnected("a", 10);
        router.add_transport(a.clone(), true);

        assert!(matches!(router.recovery_pass().await, RecoveryPass::Failed));
        assert_eq!(a.resets.load(Ordering::SeqCst), 0);
        assert!(!a.health().connected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_task_restores_faster_preferred_transport() {
        let bridge = Arc::new(crate::paper::PaperBridge::new());
        let router = Arc::new(router().with_bridge(bridge.clone()));
        let main = FakeTransport::disconnected("main", 20);
        let backup = FakeTransport::new("backup", true, 100);
        router.add_transport(main.clone(), false);
        router.add_transport(backup, true);
        router.set_preferred(Some("main".to_string()));

        let handle = router.start();
        tokio::time::sleep(router.settings().recovery_interval + Duration::from_secs(1)).await;

        assert_eq!(main.resets.load(Ordering::SeqCst), 1);
        assert_eq!(router.primary().as_deref(), Some("main"));
        assert_eq!(bridge.primary_bridge().as_deref(), Some("main"));
        handle.shutdown().await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovery_task_keeps_primary_without_meaningful_gain() {
        let router = Arc::new(router());
        let main = FakeTransport::new("main", true, 85);
        router.add_transport(main, false);
        router.add_transport(FakeTransport::new("backup", true, 100), true);
        router.set_preferred(Some("main".to_string()));

        let handle = router.start();
        tokio::time::sleep(router.settings().recovery_interval * 3).await;

        assert_eq!(router.primary().as_deref(), Some("backup"));
        handle.shutdown().await;
    }
}
