pub mod alerts;
pub mod bridge;
pub mod broker;
pub mod config;
pub mod error;
pub mod feed;
pub mod health;
pub mod logging;
pub mod metrics;
pub mod observability;
pub mod orchestrator;
pub mod paper;
pub mod remediation;
pub mod resilience;
pub mod state;
pub mod transport;
pub mod types;
