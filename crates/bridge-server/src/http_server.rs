//! HTTP servers: per-bridge status endpoint and the Prometheus metrics endpoint.

use crate::error::{BridgeError, Result};
use crate::metrics::MetricsRegistry;
use crate::partner::STATUS_PATH;
use crate::state::SharedState;
use crate::types::BridgeStatus;
use axum::{
    Json, Router,
    extract::State,
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::get,
};
use prometheus_client::encoding::text::encode;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower::ServiceBuilder;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

/// Router serving the bridge status
pub fn status_router(state: Arc<SharedState>) -> Router {
    Router::new()
        .route(STATUS_PATH, get(status_handler).fallback(method_not_allowed))
        .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
        .with_state(state)
}

/// Status endpoint of one bridge, polled by its partner
pub struct StatusServer {
    bridge: String,
    listener: TcpListener,
    router: Router,
}

impl StatusServer {
    /// Bind the status endpoint of `bridge` to `addr`
    pub async fn bind(bridge: &str, addr: SocketAddr, state: Arc<SharedState>) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| BridgeError::StatusServer { addr, source })?;
        info!(bridge = %bridge, addr = %addr, "Status server listening");

        Ok(Self {
            bridge: bridge.to_string(),
            listener,
            router: status_router(state),
        })
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    /// Serve until cancelled
    pub async fn run(self, cancel: CancellationToken) -> io::Result<()> {
        axum::serve(self.listener, self.router)
            .with_graceful_shutdown(async move { cancel.cancelled().await })
            .await?;

        info!(bridge = %self.bridge, "Status server stopped");
        Ok(())
    }
}

async fn status_handler(State(state): State<Arc<SharedState>>) -> Json<BridgeStatus> {
    Json(state.snapshot().await)
}

async fn method_not_allowed() -> Response {
    (StatusCode::BAD_REQUEST, "only GET is supported\n").into_response()
}

/// HTTP server for metrics endpoint
pub struct MetricsServer {
    /// Metrics registry
    registry: Arc<MetricsRegistry>,
    /// Listen address
    listen_addr: SocketAddr,
}

impl MetricsServer {
    /// Create a new metrics server
    pub fn new(registry: Arc<MetricsRegistry>, listen_addr: SocketAddr) -> Self {
        Self {
            registry,
            listen_addr,
        }
    }

    /// Run the HTTP server until cancelled
    pub async fn run(self, cancel: CancellationToken) -> io::Result<()> {
        info!(listen_addr = %self.listen_addr, "Starting metrics HTTP server");

        let app = Router::new()
            .route("/metrics", get(metrics_handler))
            .layer(ServiceBuilder::new().layer(TraceLayer::new_for_http()))
            .with_state(self.registry);

        let listener = TcpListener::bind(self.listen_addr).await?;
        info!(listen_addr = %self.listen_addr, "Metrics server listening");

        axum::serve(listener, app)
            .with_graceful_shutdown(async move { cancel.cancelled().await })
            .await?;

        Ok(())
    }
}

/// Handler for /metrics endpoint
async fn metrics_handler(State(registry): State<Arc<MetricsRegistry>>) -> Response {
    // gauges are only refreshed on scrape
    registry.observe().await;

    let mut buffer = String::new();
    if let Err(e) = encode(&mut buffer, &registry.registry) {
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
