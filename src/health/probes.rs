//! Built-in health probes.
//!
//! Each probe reads one collaborator and reports a single number where
//! larger is worse: milliseconds for latencies and tick age, a count for
//! backlogs.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::time::Instant;

use super::{CheckError, HealthProbe};
use crate::bridge::BridgeManager;
use crate::broker::Broker;
use crate::config::CheckKind;
use crate::feed::MarketFeed;
use crate::transport::{MessageBuffer, TransportRouter};

/// Round-trip latency of the router's primary transport.
pub struct TransportLatencyProbe {
    router: Arc<TransportRouter>,
}

impl TransportLatencyProbe {
    pub fn new(router: Arc<TransportRouter>) -> Self {
        Self { router }
    }
}

#[async_trait]
impl HealthProbe for TransportLatencyProbe {
    async fn probe(&self, _symbol: Option<&str>) -> Result<f64, CheckError> {
        Ok(self.router.probe_primary_latency().await?)
    }
}

/// Time taken by a broker position query.
pub struct BrokerLatencyProbe {
    broker: Arc<dyn Broker>,
}

impl BrokerLatencyProbe {
    pub fn new(broker: Arc<dyn Broker>) -> Self {
        Self { broker }
    }
}

#[async_trait]
impl HealthProbe for BrokerLatencyProbe {
    async fn probe(&self, _symbol: Option<&str>) -> Result<f64, CheckError> {
        let started = Instant::now();
        self.broker.get_active_positions().await?;
        Ok(started.elapsed().as_secs_f64() * 1000.0)
    }
}

/// Commands in flight on the bridge.
pub struct PendingCommandsProbe {
    bridge: Arc<dyn BridgeManager>,
}

impl PendingCommandsProbe {
    pub fn new(bridge: Arc<dyn BridgeManager>) -> Self {
        Self { bridge }
    }
}

#[async_trait]
impl HealthProbe for PendingCommandsProbe {
    async fn probe(&self, _symbol: Option<&str>) -> Result<f64, CheckError> {
        Ok(self.bridge.get_pending_commands().await? as f64)
    }
}

/// Messages waiting in the store-and-forward buffer.
pub struct BufferBacklogProbe {
    buffer: Arc<MessageBuffer>,
}

impl BufferBacklogProbe {
    pub fn new(buffer: Arc<MessageBuffer>) -> Self {
        Self { buffer }
    }
}

#[async_trait]
impl HealthProbe for BufferBacklogProbe {
    async fn probe(&self, _symbol: Option<&str>) -> Result<f64, CheckError> {
        Ok(self.buffer.stats().await?.pending as f64)
    }
}

/// Age of the last tick for a symbol.
pub struct TickFreshnessProbe {
    feed: Arc<dyn MarketFeed>,
}

impl TickFreshnessProbe {
    pub fn new(feed: Arc<dyn MarketFeed>) -> Self {
        Self { feed }
    }
}

#[async_trait]
impl HealthProbe for TickFreshnessProbe {
    async fn probe(&self, symbol: Option<&str>) -> Result<f64, CheckError> {
        let symbol = symbol.ok_or(CheckError::MissingSymbol)?;
        let age = self.feed.last_tick_age(symbol).await?;
        Ok(age.as_secs_f64() * 1000.0)
    }
}

/// Probe implementation per check kind.
#[derive(Default, Clone)]
pub struct ProbeSet {
    probes: HashMap<CheckKind, Arc<dyn HealthProbe>>,
}

impl ProbeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every built-in probe, wired to the given collaborators.
    pub fn standard(
        router: Arc<TransportRouter>,
        broker: Arc<dyn Broker>,
        bridge: Arc<dyn BridgeManager>,
        feed: Arc<dyn MarketFeed>,
    ) -> Self {
        let buffer = Arc::clone(router.buffer());
        Self::new()
            .with(CheckKind::TransportLatency, TransportLatencyProbe::new(router))
            .with(CheckKind::BrokerLatency, BrokerLatencyProbe::new(broker))
            .with(CheckKind::PendingCommands, PendingCommandsProbe::new(bridge))
            .with(CheckKind::BufferBacklog, BufferBacklogProbe::new(buffer))
            .with(CheckKind::TickFreshness, TickFreshnessProbe::new(feed))
    }

    #[must_use]
    pub fn with(mut self, kind: CheckKind, probe: impl HealthProbe + 'static) -> Self {
        self.probes.insert(kind, Arc::new(probe));
        self
    }

    pub fn get(&self, kind: CheckKind) -> Option<Arc<dyn HealthProbe>> {
        self.probes.get(&kind).cloned()
    }
}
