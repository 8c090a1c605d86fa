//! In-memory collaborators for paper runs and tests.
//!
//! `tradeguard run --paper` wires these in place of a live broker, bridge
//! manager and tick feed so the control loop can be exercised end to end
//! without a trading terminal.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use rust_decimal::Decimal;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::alerts::{AlertError, AlertMessage, AlertSink, TracingAlertSink};
use crate::bridge::{BridgeError, BridgeManager};
use crate::broker::{Broker, BrokerError, Position, Ticket, WorkingOrder};
use crate::feed::{FeedError, MarketFeed};
use crate::types::OrderSide;

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Broker holding positions in memory.
#[derive(Default)]
pub struct PaperBroker {
    positions: Mutex<BTreeMap<Ticket, Position>>,
    orders: Mutex<Vec<WorkingOrder>>,
    /// Tickets whose capped close is refused
    reject_graceful: Mutex<HashSet<Ticket>>,
    close_calls: Mutex<HashMap<Ticket, Vec<Option<Decimal>>>>,
    unreachable: AtomicBool,
}

impl PaperBroker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn open_position(
        &self,
        ticket: Ticket,
        symbol: &str,
        side: OrderSide,
        volume: Decimal,
        open_price: Decimal,
    ) {
        lock(&self.positions).insert(
            ticket,
            Position {
                ticket,
                symbol: symbol.to_string(),
                side,
                volume,
                open_price,
                opened_at: Utc::now(),
            },
        );
    }

    pub fn add_order(&self, order: WorkingOrder) {
        lock(&self.orders).push(order);
    }

    /// Refuse closes of `ticket` that carry a slippage cap.
    pub fn reject_graceful_close(&self, ticket: Ticket) {
        lock(&self.reject_graceful).insert(ticket);
    }

    pub fn set_unreachable(&self, unreachable: bool) {
        self.unreachable.store(unreachable, Ordering::SeqCst);
    }

    /// Slippage caps passed to `close_position` for `ticket`, in call order.
    pub fn close_calls(&self, ticket: Ticket) -> Vec<Option<Decimal>> {
        lock(&self.close_calls)
            .get(&ticket)
            .cloned()
            .unwrap_or_default()
    }

    fn check_reachable(&self) -> Result<(), BrokerError> {
        if self.unreachable.load(Ordering::SeqCst) {
            return Err(BrokerError::Network("paper broker offline".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl Broker for PaperBroker {
    async fn get_active_positions(&self) -> Result<Vec<Position>, BrokerError> {
        self.check_reachable()?;
        Ok(lock(&self.positions).values().cloned().collect())
    }

    async fn get_active_orders(&self) -> Result<Vec<WorkingOrder>, BrokerError> {
        self.check_reachable()?;
        Ok(lock(&self.orders).clone())
    }

    async fn close_position(
        &self,
        ticket: Ticket,
        max_slippage: Option<Decimal>,
    ) -> Result<(), BrokerError> {
        self.check_reachable()?;
        lock(&self.close_calls)
            .entry(ticket)
            .or_default()
            .push(max_slippage);

        if let Some(cap) = max_slippage {
            if lock(&self.reject_graceful).contains(&ticket) {
                return Err(BrokerError::SlippageExceeded {
                    ticket,
                    max_slippage: cap,
                });
            }
        }
        match lock(&self.positions).remove(&ticket) {
            Some(p) => {
                debug!(ticket, symbol = %p.symbol, "Paper position closed");
                Ok(())
            }
            None => Err(BrokerError::UnknownTicket(ticket)),
        }
    }
}

/// Bridge manager that completes every command instantly.
#[derive(Default)]
pub struct PaperBridge {
    paused: AtomicBool,
    pending: AtomicUsize,
    primary: Mutex<Option<String>>,
    quiesce_stall: Mutex<Option<Duration>>,
    restart_fails: AtomicBool,
    restarts: AtomicUsize,
}

impl PaperBridge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every quiesce take `stall` before completing.
    pub fn stall_quiesce(&self, stall: Duration) {
        *lock(&self.quiesce_stall) = Some(stall);
    }

    pub fn fail_agent_restart(&self) {
        self.restart_fails.store(true, Ordering::SeqCst);
    }

    pub fn set_pending(&self, pending: usize) {
        self.pending.store(pending, Ordering::SeqCst);
    }

    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub fn primary_bridge(&self) -> Option<String> {
        lock(&self.primary).clone()
    }

    pub fn restarts(&self) -> usize {
        self.restarts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl BridgeManager for PaperBridge {
    async fn quiesce_at_sequence_boundary(&self) -> Result<(), BridgeError> {
        let stall = *lock(&self.quiesce_stall);
        if let Some(stall) = stall {
            tokio::time::sleep(stall).await;
        }
        self.pending.store(0, Ordering::SeqCst);
        Ok(())
    }

    async fn set_command_pause(&self, paused: bool) -> Result<(), BridgeError> {
        self.paused.store(paused, Ordering::SeqCst);
        info!(paused, "Paper bridge command pause updated");
        Ok(())
    }

    async fn set_primary_bridge(&self, name: &str) -> Result<(), BridgeError> {
        *lock(&self.primary) = Some(name.to_string());
        Ok(())
    }

    async fn get_pending_commands(&self) -> Result<usize, BridgeError> {
        Ok(self.pending.load(Ordering::SeqCst))
    }

    async fn restart_external_agent(&self) -> Result<(), BridgeError> {
        if self.restart_fails.load(Ordering::SeqCst) {
            return Err(BridgeError::AgentRestart("paper agent refused restart".to_string()));
        }
        self.restarts.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }
}

/// Feed whose ticks are recorded by hand.
#[derive(Default)]
pub struct PaperFeed {
    last_tick: Mutex<HashMap<String, Instant>>,
}

impl PaperFeed {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record_tick(&self, symbol: &str) {
        lock(&self.last_tick).insert(symbol.to_string(), Instant::now());
    }
}

#[async_trait]
impl MarketFeed for PaperFeed {
    async fn last_tick_age(&self, symbol: &str) -> Result<Duration, FeedError> {
        lock(&self.last_tick)
            .get(symbol)
            .map(|at| at.elapsed())
            .ok_or_else(|| FeedError::NoData(symbol.to_string()))
    }
}

/// Alert sink that keeps every alert and also logs it.
#[derive(Default)]
pub struct RecordingAlertSink {
    sent: Mutex<Vec<(Vec<String>, AlertMessage)>>,
    log: TracingAlertSink,
}

impl RecordingAlertSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn sent(&self) -> Vec<(Vec<String>, AlertMessage)> {
        lock(&self.sent).clone()
    }
}

#[async_trait]
impl AlertSink for RecordingAlertSink {
    async fn send(&self, channels: &[String], message: &AlertMessage) -> Result<(), AlertError> {
        self.log.send(channels, message).await?;
        lock(&self.sent).push((channels.to_vec(), message.clone()));
        Ok(())
    }
}
