//! Market feed collaborator.
//!
//! Tick subscription belongs to the terminal integration; the control core
//! only asks how stale each symbol's last tick is.

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum FeedError {
    #[error("No tick received yet for {0}")]
    NoData(String),
    #[error("Feed unavailable: {0}")]
    Unavailable(String),
}

#[async_trait]
pub trait MarketFeed: Send + Sync {
    /// Time since the last tick for `symbol`.
    async fn last_tick_age(&self, symbol: &str) -> Result<Duration, FeedError>;
}
