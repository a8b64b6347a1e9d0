//! HTTP server for the Prometheus metrics and peer status endpoints.

use crate::metrics::MetricsRegistry;
use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use heartbeat::{HeartbeatInterface, HeartbeatStats, LifeCheckRegistry, PeerSnapshot};
use prometheus_client::encoding::text::encode;
use serde::Serialize;
use std::sync::Arc;
use tokio::net::TcpListener;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// Shared state behind the HTTP handlers
#[derive(Debug, Clone)]
pub struct AppState {
    pub metrics: Arc<MetricsRegistry>,
    pub registry: Arc<LifeCheckRegistry>,
    pub heartbeat_stats: Arc<Vec<(HeartbeatInterface, Arc<HeartbeatStats>)>>,
}

/// One row of `/peers`
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PeerStatus {
    pub hostname: String,
    pub wd_port: u16,
    pub pgpool_port: u16,
    pub state: String,
    pub retry_lives: i32,
    /// Sender's clock, `sec.usec`
    pub last_send_time: String,
    /// Local clock at receipt, `sec.usec`
    pub last_recv_time: String,
}

impl From<PeerSnapshot> for PeerStatus {
    fn from(peer: PeerSnapshot) -> Self {
        Self {
            hostname: peer.node.hostname,
            wd_port: peer.node.wd_port,
            pgpool_port: peer.node.pgpool_port,
            state: peer.state.to_string(),
            retry_lives: peer.retry_lives,
            last_send_time: peer.send_time.to_string(),
            last_recv_time: peer.recv_time.to_string(),
        }
    }
}

/// HTTP server for metrics and status
pub struct MetricsServer {
    state: AppState,
    /// Listen address
    listen_addr: String,
}

impl MetricsServer {
    pub fn new(state: AppState, listen_addr: String) -> Self {
        Self { state, listen_addr }
    }

    pub fn listen_addr(&self) -> &str {
        &self.listen_addr
    }

    /// Router serving `/metrics` and `/peers`
    pub fn router(state: AppState) -> Router {
        Router::new()
            .route("/metrics", get(metrics_handler))
            .route("/peers", get(peers_handler))
            .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
            .with_state(state)
    }

    /// Run the HTTP server
    pub async fn run(self) -> std::io::Result<()> {
        info!(listen_addr = %self.listen_addr, "Starting metrics HTTP server");

        let app = Self::router(self.state);

        let listener = TcpListener::bind(&self.listen_addr).await?;
        info!(listen_addr = %self.listen_addr, "Metrics server listening");

        axum::serve(listener, app).await
    }
}

/// Handler for /metrics endpoint
async fn metrics_handler(State(state): State<AppState>) -> Response {
    for (iface, stats) in state.heartbeat_stats.iter() {
        state.metrics.sync_heartbeat(iface, stats);
    }
    for peer in state.registry.snapshots() {
        state.metrics.update_peer(&peer);
    }

    let mut buffer = String::new();
    if let Err(e) = encode(&mut buffer, &state.metrics.registry) {
        warn!(error = %e, "Failed to encode metrics");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            format!("Failed to encode metrics: {}", e),
        )
            .into_response();
    }

    (
        StatusCode::OK,
        [("content-type", "text/plain; version=0.0.4")],
        buffer,
    )
        .into_response()
}

/// Handler for /peers endpoint
async fn peers_handler(State(state): State<AppState>) -> Json<Vec<PeerStatus>> {
    Json(
        state
            .registry
            .snapshots()
            .into_iter()
            .map(PeerStatus::from)
            .collect(),
    )
}
