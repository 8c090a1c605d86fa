//! Reconciliation of the local position book with broker truth.
//!
//! The broker is authoritative. Small drift is corrected locally; drift at
//! or above the halt threshold halts the symbol until an operator clears it.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use rust_decimal::Decimal;
use tokio::sync::RwLock;
use tracing::{debug, error, info, warn};

use crate::broker::{Broker, BrokerError, Position};

/// Outcome for one symbol.
#[derive(Debug, Clone, PartialEq)]
pub struct ReconciliationResult {
    pub symbol: String,
    /// Net signed volume in the local book
    pub local_position: Decimal,
    /// Net signed volume reported by the broker
    pub broker_position: Decimal,
    pub drift: Decimal,
    pub action_taken: ReconciliationAction,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconciliationAction {
    NoAction,
    /// Local book overwritten with the broker's figure
    LocalCorrected,
    /// Drift at or above the halt threshold
    TradingHalted,
}

impl std::fmt::Display for ReconciliationAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::NoAction => write!(f, "no_action"),
            Self::LocalCorrected => write!(f, "local_corrected"),
            Self::TradingHalted => write!(f, "trading_halted"),
        }
    }
}

/// Net signed exposure per symbol.
pub fn net_positions(positions: &[Position]) -> BTreeMap<String, Decimal> {
    let mut net = BTreeMap::new();
    for p in positions {
        *net.entry(p.symbol.clone()).or_insert(Decimal::ZERO) += p.signed_volume();
    }
    net
}

pub struct PositionReconciler {
    broker: Arc<dyn Broker>,
    halt_threshold: Decimal,
    /// symbol -> net signed volume
    local_positions: RwLock<HashMap<String, Decimal>>,
    /// symbol -> halt reason
    halted_symbols: RwLock<HashMap<String, String>>,
    /// Book has been seeded from the broker at least once
    seeded: AtomicBool,
}

impl PositionReconciler {
    pub fn new(broker: Arc<dyn Broker>, halt_threshold: Decimal) -> Self {
        Self {
            broker,
            halt_threshold,
            local_positions: RwLock::new(HashMap::new()),
            halted_symbols: RwLock::new(HashMap::new()),
            seeded: AtomicBool::new(false),
        }
    }

    pub fn is_seeded(&self) -> bool {
        self.seeded.load(Ordering::SeqCst)
    }

    /// Apply a fill to the local book. `delta` is positive for buys.
    pub async fn update_local_position(&self, symbol: &str, delta: Decimal) {
        let mut positions = self.local_positions.write().await;
        let current = positions.entry(symbol.to_string()).or_insert(Decimal::ZERO);
        *current += delta;
        debug!(symbol, delta = %delta, new_position = %*current, "Local position updated");
    }

    pub async fn set_local_position(&self, symbol: &str, volume: Decimal) {
        self.local_positions
            .write()
            .await
            .insert(symbol.to_string(), volume);
    }

    pub async fn get_local_position(&self, symbol: &str) -> Decimal {
        self.local_positions
            .read()
            .await
            .get(symbol)
            .copied()
            .unwrap_or(Decimal::ZERO)
    }

    pub async fn is_halted(&self, symbol: &str) -> bool {
        self.halted_symbols.read().await.contains_key(symbol)
    }

    pub async fn halted_symbols(&self) -> Vec<String> {
        let mut symbols: Vec<String> = self.halted_symbols.read().await.keys().cloned().collect();
        symbols.sort();
        symbols
    }

    /// Clear a halt after manual intervention.
    pub async fn clear_halt(&self, symbol: &str) {
        if self.halted_symbols.write().await.remove(symbol).is_some() {
            info!(symbol, "Trading halt cleared");
        }
    }

    /// Seed the local book from the broker, replacing whatever it held.
    pub async fn initialize_from_broker(&self) -> Result<(), BrokerError> {
        let net = net_positions(&self.broker.get_active_positions().await?);
        self.seed(&net).await;
        Ok(())
    }

    async fn seed(&self, net: &BTreeMap<String, Decimal>) {
        let mut local = self.local_positions.write().await;
        local.clear();
        local.extend(net.iter().map(|(symbol, volume)| (symbol.clone(), *volume)));
        self.seeded.store(true, Ordering::SeqCst);
        info!(symbols = local.len(), "Local position book initialized from broker");
    }

    async fn reconcile_one(&self, symbol: &str, broker: Decimal) -> ReconciliationResult {
        let local = self.get_local_position(symbol).await;
        let drift = (broker - local).abs();

        let action = if drift.is_zero() {
            ReconciliationAction::NoAction
        } else if drift >= self.halt_threshold {
            error!(
                symbol,
                local = %local,
                broker = %broker,
                drift = %drift,
                threshold = %self.halt_threshold,
                "CRITICAL: Position drift exceeds halt threshold - trading halted"
            );
            self.halted_symbols.write().await.insert(
                symbol.to_string(),
                format!("drift {} exceeds threshold {}", drift, self.halt_threshold),
            );
            ReconciliationAction::TradingHalted
        } else {
            warn!(symbol, local = %local, broker = %broker, drift = %drift, "Position drift corrected to broker truth");
            self.set_local_position(symbol, broker).await;
            ReconciliationAction::LocalCorrected
        };

        ReconciliationResult {
            symbol: symbol.to_string(),
            local_position: local,
            broker_position: broker,
            drift,
            action_taken: action,
        }
    }

    /// Reconcile every symbol known locally or at the broker, in symbol order.
    /// A book that was never seeded is seeded from this snapshot first.
    pub async fn reconcile_all(&self) -> Result<Vec<ReconciliationResult>, BrokerError> {
        let broker = net_positions(&self.broker.get_active_positions().await?);
        if !self.is_seeded() {
            warn!("Local position book was never seeded, taking broker snapshot as baseline");
            self.seed(&broker).await;
        }

        let mut symbols: Vec<String> = self.local_positions.read().await.keys().cloned().collect();
        symbols.extend(broker.keys().cloned());
        symbols.sort();
        symbols.dedup();

        let mut results = Vec::with_capacity(symbols.len());
        for symbol in symbols {
            let truth = broker.get(&symbol).copied().unwrap_or(Decimal::ZERO);
            results.push(self.reconcile_one(&symbol, truth).await);
        }

        let corrections = results
            .iter()
            .filter(|r| r.action_taken != ReconciliationAction::NoAction)
            .count();
        info!(total = results.len(), corrections, "Reconciliation with broker completed");
        Ok(results)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::{Ticket, WorkingOrder};
    use crate::types::OrderSide;
    use async_trait::async_trait;
    use chrono::Utc;
    use mockall::mock;
    use rust_decimal_macros::dec;

    mock! {
        pub TestBroker {}

        #[async_trait]
        impl Broker for TestBroker {
            async fn get_active_positions(&self) -> Result<Vec<Position>, BrokerError>;
            async fn get_active_orders(&self) -> Result<Vec<WorkingOrder>, BrokerError>;
            async fn close_position(&self, ticket: Ticket, max_slippage: Option<Decimal>) -> Result<(), BrokerError>;
        }
    }

    fn position(ticket: Ticket, symbol: &str, side: OrderSide, volume: Decimal) -> Position {
        Position {
            ticket,
            symbol: symbol.to_string(),
            side,
            volume,
            open_price: dec!(1.1),
            opened_at: Utc::now(),
        }
    }

    fn broker_with(positions: Vec<Position>) -> Arc<dyn Broker> {
        let mut broker = MockTestBroker::new();
        broker
            .expect_get_active_positions()
            .returning(move || Ok(positions.clone()));
        Arc::new(broker)
    }

    #[test]
    fn test_net_positions_offsets_sides() {
        let net = net_positions(&[
            position(1, "EURUSD", OrderSide::Buy, dec!(1.0)),
            position(2, "EURUSD", OrderSide::Sell, dec!(0.4)),
            position(3, "XAUUSD", OrderSide::Sell, dec!(0.1)),
        ]);
        assert_eq!(net["EURUSD"], dec!(0.6));
        assert_eq!(net["XAUUSD"], dec!(-0.1));
    }

    #[tokio::test]
    async fn test_small_drift_corrected_large_drift_halts() {
        let broker = broker_with(vec![
            position(1, "EURUSD", OrderSide::Buy, dec!(1.0)),
            position(2, "XAUUSD", OrderSide::Buy, dec!(2.0)),
        ]);
        let reconciler = PositionReconciler::new(broker, dec!(0.5));
        reconciler.initialize_from_broker().await.unwrap();
        reconciler.set_local_position("EURUSD", dec!(0.9)).await;
        reconciler.set_local_position("XAUUSD", dec!(1.0)).await;
        reconciler.set_local_position("GBPUSD", dec!(0)).await;

        let results = reconciler.reconcile_all().await.unwrap();
        let actions: Vec<_> = results
            .iter()
            .map(|r| (r.symbol.as_str(), r.action_taken))
            .collect();
        assert_eq!(
            actions,
            vec![
                ("EURUSD", ReconciliationAction::LocalCorrected),
                ("GBPUSD", ReconciliationAction::NoAction),
                ("XAUUSD", ReconciliationAction::TradingHalted),
            ]
        );
        assert_eq!(reconciler.get_local_position("EURUSD").await, dec!(1.0));
        assert!(reconciler.is_halted("XAUUSD").await);

        reconciler.clear_halt("XAUUSD").await;
        assert!(reconciler.halted_symbols().await.is_empty());
    }

    #[tokio::test]
    async fn test_initialize_from_broker() {
        let broker = broker_with(vec![position(1, "EURUSD", OrderSide::Sell, dec!(0.3))]);
        let reconciler = PositionReconciler::new(broker, dec!(0.01));
        reconciler.update_local_position("GBPUSD", dec!(5)).await;

        reconciler.initialize_from_broker().await.unwrap();
        assert_eq!(reconciler.get_local_position("EURUSD").await, dec!(-0.3));
        assert_eq!(reconciler.get_local_position("GBPUSD").await, dec!(0));
    }

    #[tokio::test]
    async fn test_unseeded_book_takes_broker_baseline() {
        let broker = broker_with(vec![
            position(1, "EURUSD", OrderSide::Buy, dec!(0.1)),
            position(2, "XAUUSD", OrderSide::Sell, dec!(2.0)),
        ]);
        let reconciler = PositionReconciler::new(broker, dec!(0.05));
        assert!(!reconciler.is_seeded());

        let results = reconciler.reconcile_all().await.unwrap();
        assert_eq!(results.len(), 2);
        assert!(results
            .iter()
            .all(|r| r.action_taken == ReconciliationAction::NoAction));
        assert!(reconciler.is_seeded());
        assert!(reconciler.halted_symbols().await.is_empty());
        assert_eq!(reconciler.get_local_position("XAUUSD").await, dec!(-2.0));
    }

    #[tokio::test]
    async fn test_drift_after_seeding_still_halts() {
        let broker = broker_with(vec![position(1, "EURUSD", OrderSide::Buy, dec!(0.1))]);
        let reconciler = PositionReconciler::new(broker, dec!(0.05));
        reconciler.initialize_from_broker().await.unwrap();

        // A fill the broker never saw
        reconciler.update_local_position("EURUSD", dec!(0.2)).await;

        let results = reconciler.reconcile_all().await.unwrap();
        assert_eq!(results[0].action_taken, ReconciliationAction::TradingHalted);
        assert_eq!(results[0].drift, dec!(0.2));
        assert!(reconciler.is_halted("EURUSD").await);
    }
}
