//! End-to-end tests across the public API: failover and store-and-forward,
//! mode persistence, and the remediation playbooks against paper
//! collaborators.

use async_trait::async_trait;
use rust_decimal_macros::dec;
use serde_json::json;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tradeguard::config::RemediationConfig;
use tradeguard::paper::{PaperBridge, PaperBroker, RecordingAlertSink};
use tradeguard::remediation::{
    close_all_positions, ManualLatch, PlaybookOutcome, RemediationAction, RemediationEngine,
    RemediationPlaybook, RemediationStep, RemediationTrigger,
};
use tradeguard::state::{ModeStore, StateMachine, SystemMode};
use tradeguard::transport::{
    DeliveryOutcome, MessageBuffer, RouterSettings, Transport, TransportError, TransportHealth,
    TransportMessage, TransportRouter,
};
use tradeguard::types::OrderSide;

struct StubTransport {
    name: String,
    up: AtomicBool,
    attempts: AtomicU64,
}

impl StubTransport {
    fn new(name: &str, up: bool) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            up: AtomicBool::new(up),
            attempts: AtomicU64::new(0),
        })
    }
}

#[async_trait]
impl Transport for StubTransport {
    fn name(&self) -> &str {
        &self.name
    }

    async fn send(&self, _message: &TransportMessage) -> Result<(), TransportError> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.up.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(TransportError::Connectivity {
                transport: self.name.clone(),
                reason: "link down".into(),
            })
        }
    }

    fn health(&self) -> TransportHealth {
        TransportHealth {
            name: self.name.clone(),
            connected: true,
            messages_sent: 0,
            messages_received: 0,
            last_error: None,
            latency_samples: Vec::new(),
        }
    }

    async fn reset(&self) -> Result<(), TransportError> {
        Ok(())
    }

    async fn probe_latency(&self) -> Result<Duration, TransportError> {
        Ok(Duration::from_millis(5))
    }
}

fn router() -> TransportRouter {
    TransportRouter::new(
        Arc::new(MessageBuffer::in_memory().unwrap()),
        RouterSettings::default(),
    )
}

#[tokio::test]
async fn test_failover_reaches_third_transport() {
    let router = router();
    let a = StubTransport::new("a", false);
    let b = StubTransport::new("b", false);
    let c = StubTransport::new("c", true);
    router.add_transport(a.clone(), true);
    router.add_transport(b.clone(), false);
    router.add_transport(c.clone(), false);

    let msg = TransportMessage::new("order", json!({"symbol": "EURUSD", "qty": "1.0"}));
    let outcome = router.send_with_failover(&msg).await.unwrap();

    assert_eq!(outcome, DeliveryOutcome::Delivered("c".to_string()));
    assert_eq!(a.attempts.load(Ordering::SeqCst), 1);
    assert_eq!(b.attempts.load(Ordering::SeqCst), 1);
    assert_eq!(router.buffer().stats().await.unwrap().total, 0);
}

#[tokio::test]
async fn test_all_transports_down_buffers_exactly_once() {
    let router = router();
    router.add_transport(StubTransport::new("a", false), true);
    router.add_transport(StubTransport::new("b", false), false);

    let msg = TransportMessage::new("order", json!({"n": 7})).with_priority(5);
    assert_eq!(
        router.send_with_failover(&msg).await.unwrap(),
        DeliveryOutcome::Buffered
    );

    let stats = router.buffer().stats().await.unwrap();
    assert_eq!(stats.total, 1);
    assert_eq!(stats.pending, 1);

    let record = router.buffer().get(&msg.msg_id).await.unwrap().unwrap();
    assert_eq!(record.priority, 5);
    assert_eq!(record.transport_tried.as_deref(), Some("b"));
    assert_eq!(record.message().unwrap(), msg);
}

#[tokio::test]
async fn test_replay_stops_at_max_retries() {
    let router = router();
    let a = StubTransport::new("a", false);
    router.add_transport(a.clone(), true);

    let msg = TransportMessage::new("order", json!({"n": 1})).with_max_retries(2);
    router.send_with_failover(&msg).await.unwrap();

    let buffer = Arc::clone(router.buffer());
    let first = buffer.replay(&router).await.unwrap();
    assert_eq!((first.selected, first.rebuffered), (1, 1));
    let second = buffer.replay(&router).await.unwrap();
    assert_eq!((second.selected, second.rebuffered), (1, 1));

    // Two claims used up the budget
    let third = buffer.replay(&router).await.unwrap();
    assert_eq!(third.selected, 0);
    let stats = buffer.stats().await.unwrap();
    assert_eq!(stats.exhausted, 1);
    assert_eq!(stats.pending, 0);

    assert_eq!(buffer.purge().await.unwrap(), 1);
    assert_eq!(buffer.stats().await.unwrap().total, 0);
}

#[tokio::test]
async fn test_replay_skips_expired_and_delivers_the_rest() {
    let router = router();
    let a = StubTransport::new("a", true);
    router.add_transport(a.clone(), true);
    let buffer = Arc::clone(router.buffer());

    let live = TransportMessage::new("order", json!({"n": 1}));
    let stale = TransportMessage::new("order", json!({"n": 2}));
    buffer.buffer(&live, Some("a")).await.unwrap();
    buffer
        .buffer_with_deadline(&stale, Some("a"), chrono::Utc::now() - chrono::Duration::seconds(1))
        .await
        .unwrap();

    let report = buffer.replay(&router).await.unwrap();
    assert_eq!(report.selected, 1);
    assert_eq!(report.delivered, 1);
    assert_eq!(a.attempts.load(Ordering::SeqCst), 1);

    let stats = buffer.stats().await.unwrap();
    assert_eq!(stats.acknowledged, 1);
    assert_eq!(stats.expired, 1);
    assert_eq!(buffer.purge().await.unwrap(), 2);
}

#[tokio::test]
async fn test_replay_orders_by_priority() {
    let router = router();
    let a = StubTransport::new("a", false);
    router.add_transport(a.clone(), true);
    let buffer = Arc::clone(router.buffer());

    let low = TransportMessage::new("telemetry", json!({"n": 1}));
    let high = TransportMessage::new("order", json!({"n": 2})).with_priority(10);
    buffer.buffer(&low, None).await.unwrap();
    buffer.buffer(&high, None).await.unwrap();

    let pending = buffer.pending(10).await.unwrap();
    let ids: Vec<&str> = pending.iter().map(|r| r.msg_id.as_str()).collect();
    assert_eq!(ids, vec![high.msg_id.as_str(), low.msg_id.as_str()]);
}

#[test]
fn test_mode_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mode.json");

    {
        let machine = StateMachine::with_store(ModeStore::new(&path)).unwrap();
        assert_eq!(machine.current(), SystemMode::Healthy);
        let transition = machine
            .transition_to(SystemMode::SafeMode, "escalated")
            .unwrap()
            .unwrap();
        assert!(transition.is_degrading());
    }

    let restored = StateMachine::with_store(ModeStore::new(&path)).unwrap();
    assert_eq!(restored.current(), SystemMode::SafeMode);
}

#[tokio::test]
async fn test_close_all_four_of_five_graceful() {
    let broker = PaperBroker::new();
    for ticket in 1..=5u64 {
        broker.open_position(ticket, "EURUSD", OrderSide::Buy, dec!(1.0), dec!(1.0850));
    }
    broker.reject_graceful_close(3);

    let report = close_all_positions(&broker, dec!(0.0005), 0.8).await.unwrap();
    assert_eq!(report.total, 5);
    assert_eq!(report.graceful.len(), 4);
    assert_eq!(report.forced, vec![3]);
    assert!(report.failed.is_empty());
    assert!(report.is_success(0.8));
}

#[tokio::test(start_paused = true)]
async fn test_stalled_playbook_latches_and_enters_safe_mode() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = RemediationConfig::default();
    config.remediation.checkpoint_dir = dir.path().join("checkpoints");
    config.remediation.alert_channels = vec!["pager".to_string()];

    let state = Arc::new(StateMachine::new(SystemMode::Degraded));
    let bridge = Arc::new(PaperBridge::new());
    bridge.stall_quiesce(Duration::from_secs(600));
    let alerts = Arc::new(RecordingAlertSink::new());
    let latch_path = dir.path().join("latch.json");
    let latch = Arc::new(ManualLatch::open(&latch_path).unwrap());

    let engine = RemediationEngine::new(
        Arc::new(config),
        Arc::clone(&state),
        Arc::new(router()),
        Arc::new(PaperBroker::new()),
        bridge.clone(),
        alerts.clone(),
        Arc::clone(&latch),
    );

    let playbook = RemediationPlaybook {
        name: "bridge_recovery".to_string(),
        max_duration: Duration::from_secs(120),
        steps: vec![
            RemediationStep::new("pause", RemediationAction::PauseNewCommands, Duration::from_secs(5)),
            RemediationStep::new(
                "quiesce",
                RemediationAction::QuiesceAtSequenceBoundary,
                Duration::from_secs(30),
            ),
            RemediationStep::new("restart", RemediationAction::RestartExternalAgent, Duration::from_secs(30)),
        ],
    };
    let trigger = RemediationTrigger::new("bridge_latency", SystemMode::Degraded)
        .with_metric("bridge_latency", 950.0);

    let report = engine.run_playbook(&playbook, &trigger).await;

    assert!(matches!(report.outcome, PlaybookOutcome::Escalated { .. }));
    assert_eq!(report.steps.len(), 2);
    assert_eq!(bridge.restarts(), 0);
    assert_eq!(alerts.sent().len(), 1);
    assert_eq!(state.current(), SystemMode::SafeMode);
    assert!(latch.is_engaged());
    assert!(engine.commands_paused());

    // Operator release from another process
    assert!(ManualLatch::reset(&latch_path).unwrap());
    assert!(latch.refresh_from_disk());
    engine.on_latch_released().await;
    assert!(!engine.commands_paused());
}
