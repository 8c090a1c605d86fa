//! Graceful close-out of every open position.
//!
//! Positions are closed instrument by instrument with a slippage cap. The
//! pass is acceptable when at least `graceful_ratio` of them close that way;
//! whatever is left is then force-closed without a cap so no exposure is left
//! ambiguous.

use std::collections::BTreeMap;

use rust_decimal::Decimal;
use tracing::{error, info, warn};

use crate::broker::{Broker, BrokerError, Position, Ticket};

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CloseReport {
    pub total: usize,
    pub graceful: Vec<Ticket>,
    pub forced: Vec<Ticket>,
    /// Tickets still open after the forced pass
    pub failed: Vec<Ticket>,
    pub graceful_ratio: f64,
    /// Net signed volume taken off the book per symbol
    pub closed_volume: BTreeMap<String, Decimal>,
}

impl CloseReport {
    /// Graceful share met the threshold and nothing was left open.
    pub fn is_success(&self, threshold: f64) -> bool {
        self.graceful_ratio >= threshold && self.failed.is_empty()
    }

    fn record_closed(&mut self, position: &Position) {
        *self
            .closed_volume
            .entry(position.symbol.clone())
            .or_insert(Decimal::ZERO) += position.signed_volume();
    }
}

fn by_symbol(positions: Vec<Position>) -> BTreeMap<String, Vec<Position>> {
    let mut grouped: BTreeMap<String, Vec<Position>> = BTreeMap::new();
    for p in positions {
        grouped.entry(p.symbol.clone()).or_default().push(p);
    }
    grouped
}

pub async fn close_all_positions(
    broker: &dyn Broker,
    max_slippage: Decimal,
    threshold: f64,
) -> Result<CloseReport, BrokerError> {
    let positions = broker.get_active_positions().await?;
    let mut report = CloseReport {
        total: positions.len(),
        graceful_ratio: 1.0,
        ..Default::default()
    };
    if positions.is_empty() {
        info!("No open positions to close");
        return Ok(report);
    }

    let mut remaining = Vec::new();
    for (symbol, group) in by_symbol(positions) {
        for p in group {
            match broker.close_position(p.ticket, Some(max_slippage)).await {
                Ok(()) => {
                    report.graceful.push(p.ticket);
                    report.record_closed(&p);
                }
                Err(e) => {
                    warn!(symbol = %symbol, ticket = p.ticket, error = %e, "Graceful close failed");
                    remaining.push(p);
                }
            }
        }
    }
    report.graceful_ratio = report.graceful.len() as f64 / report.total as f64;

    for p in remaining {
        match broker.close_position(p.ticket, None).await {
            Ok(()) => {
                warn!(ticket = p.ticket, "Position force-closed without slippage cap");
                report.forced.push(p.ticket);
                report.record_closed(&p);
            }
            Err(e) => {
                error!(ticket = p.ticket, error = %e, "Force close failed, position still open");
                report.failed.push(p.ticket);
            }
        }
    }

    let acceptable = report.graceful_ratio >= threshold;
    info!(
        total = report.total,
        graceful = report.graceful.len(),
        forced = report.forced.len(),
        failed = report.failed.len(),
        ratio = report.graceful_ratio,
        acceptable,
        "Close-all pass finished"
    );
    Ok(report)
}
