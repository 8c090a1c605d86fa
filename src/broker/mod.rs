//! Broker Abstraction Layer
//!
//! The broker is the source of truth for positions and working orders. The
//! control core only ever reads that truth and asks for positions to be
//! closed; order entry lives elsewhere.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use crate::types::OrderSide;

/// Broker-assigned ticket number.
pub type Ticket = u64;

/// Errors reported by a broker collaborator.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum BrokerError {
    #[error("Broker unreachable: {0}")]
    Network(String),

    #[error("Close of ticket {ticket} rejected: {reason}")]
    Rejected { ticket: Ticket, reason: String },

    #[error("Close of ticket {ticket} would exceed slippage cap {max_slippage}")]
    SlippageExceeded { ticket: Ticket, max_slippage: Decimal },

    #[error("Unknown ticket {0}")]
    UnknownTicket(Ticket),
}

/// An open position as reported by the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Position {
    pub ticket: Ticket,
    pub symbol: String,
    pub side: OrderSide,
    pub volume: Decimal,
    pub open_price: Decimal,
    pub opened_at: DateTime<Utc>,
}

impl Position {
    /// Signed exposure: long positions positive, short negative.
    pub fn signed_volume(&self) -> Decimal {
        match self.side {
            OrderSide::Buy => self.volume,
            OrderSide::Sell => -self.volume,
        }
    }
}

/// A working order as reported by the broker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkingOrder {
    pub ticket: Ticket,
    pub symbol: String,
    pub side: OrderSide,
    pub volume: Decimal,
    pub price: Option<Decimal>,
    pub placed_at: DateTime<Utc>,
}

/// Position and order operations the control core consumes.
#[async_trait]
pub trait Broker: Send + Sync {
    /// Positions currently open at the broker
    async fn get_active_positions(&self) -> Result<Vec<Position>, BrokerError>;

    /// Orders currently working at the broker
    async fn get_active_orders(&self) -> Result<Vec<WorkingOrder>, BrokerError>;

    /// Close a position. `max_slippage` of `None` closes at any price.
    async fn close_position(
        &self,
        ticket: Ticket,
        max_slippage: Option<Decimal>,
    ) -> Result<(), BrokerError>;
}
