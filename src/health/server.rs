//! HTTP endpoints for operators and scrapers.
//!
//! `/health` serves the latest [`StatusSnapshot`] written by the orchestrator
//! after each tick; `/metrics` serves the Prometheus registry.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::{routing::get, Json, Router};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;

use super::HealthMetric;
use crate::metrics;
use crate::resilience::CircuitState;
use crate::state::SystemMode;
use crate::transport::{BufferStats, RouteStatus};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakerStatus {
    pub name: String,
    pub state: CircuitState,
}

/// Everything `/health` reports.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub mode: SystemMode,
    pub latch_engaged: bool,
    pub checks: Vec<HealthMetric>,
    pub breakers: Vec<BreakerStatus>,
    pub transports: Vec<RouteStatus>,
    pub buffer: Option<BufferStats>,
    pub uptime_seconds: u64,
    pub version: String,
    pub timestamp: DateTime<Utc>,
}

impl Default for StatusSnapshot {
    fn default() -> Self {
        Self {
            mode: SystemMode::Healthy,
            latch_engaged: false,
            checks: Vec::new(),
            breakers: Vec::new(),
            transports: Vec::new(),
            buffer: None,
            uptime_seconds: 0,
            version: env!("CARGO_PKG_VERSION").to_string(),
            timestamp: Utc::now(),
        }
    }
}

pub type HealthState = Arc<RwLock<StatusSnapshot>>;

pub fn create_health_state() -> HealthState {
    Arc::new(RwLock::new(StatusSnapshot::default()))
}

/// 200 while trading is possible, 503 in SAFE_MODE or with the latch engaged.
async fn health_check(State(state): State<HealthState>) -> (StatusCode, Json<StatusSnapshot>) {
    let snapshot = state.read().await.clone();
    let code = if snapshot.mode == SystemMode::SafeMode || snapshot.latch_engaged {
        StatusCode::SERVICE_UNAVAILABLE
    } else {
        StatusCode::OK
    };
    (code, Json(snapshot))
}

async fn metrics_endpoint() -> String {
    metrics::gather_metrics()
}

pub fn router(state: HealthState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/metrics", get(metrics_endpoint))
        .with_state(state)
}

/// Serve on an already bound listener until `shutdown` fires.
pub async fn serve_health(
    listener: TcpListener,
    state: HealthState,
    shutdown: CancellationToken,
) -> std::io::Result<()> {
    axum::serve(listener, router(state))
        .with_graceful_shutdown(shutdown.cancelled_owned())
        .await
}

/// Bind `0.0.0.0:port` and serve. A bind failure is logged and the control
/// loop keeps running without the endpoint.
pub async fn run_health_server(port: u16, state: HealthState, shutdown: CancellationToken) {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = match TcpListener::bind(addr).await {
        Ok(l) => l,
        Err(e) => {
            tracing::error!(%addr, error = %e, "Health server failed to bind, continuing without health endpoint");
            return;
        }
    };
    tracing::info!(%addr, "Health server listening");

    if let Err(e) = serve_health(listener, state, shutdown).await {
        tracing::error!(error = %e, "Health server failed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    async fn get(addr: SocketAddr, path: &str) -> String {
        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        let request = format!(
            "GET {} HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n",
            path
        );
        stream.write_all(request.as_bytes()).await.unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        response
    }

    #[tokio::test]
    async fn test_health_reports_snapshot_and_safe_mode_status() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let state = create_health_state();
        let shutdown = CancellationToken::new();
        let server = tokio::spawn(serve_health(listener, state.clone(), shutdown.clone()));

        let ok = get(addr, "/health").await;
        assert!(ok.starts_with("HTTP/1.1 200"));
        assert!(ok.contains("\"mode\":\"healthy\""));

        state.write().await.mode = SystemMode::SafeMode;
        let unavailable = get(addr, "/health").await;
        assert!(unavailable.starts_with("HTTP/1.1 503"));
        assert!(unavailable.contains("\"mode\":\"safe_mode\""));

        metrics::set_system_mode(SystemMode::SafeMode.as_gauge());
        let scrape = get(addr, "/metrics").await;
        assert!(scrape.contains("tradeguard_system_mode"));

        shutdown.cancel();
        server.await.unwrap().unwrap();
    }
}
