//! Main bridge server implementation.

use crate::bridge::Bridge;
use crate::error::{BridgeError, Result};
use crate::http_server::MetricsServer;
use crate::metrics::MetricsRegistry;
use crate::types::ServerConfig;
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

/// Runs every configured bridge and the metrics endpoint
pub struct BridgeServer {
    config: ServerConfig,
}

impl BridgeServer {
    /// Create a new bridge server
    pub fn new(config: ServerConfig) -> Self {
        Self { config }
    }

    /// Run until a shutdown signal or a fatal bridge fault.
    ///
    /// Every bridge is built before anything runs, so a startup fault in any
    /// of them aborts the whole server.
    pub async fn run(self) -> Result<()> {
        self.run_until(shutdown_signal()).await
    }

    /// Same as [`BridgeServer::run`] with a custom shutdown trigger
    pub async fn run_until(self, shutdown: impl Future<Output = ()>) -> Result<()> {
        info!(bridges = self.config.bridges.len(), "Starting bridge server");

        let metrics = if self.config.metrics_enabled {
            info!("Metrics enabled on {}", self.config.metrics_listen_addr);
            Some(Arc::new(MetricsRegistry::new(&self.config.metrics_latency_buckets)))
        } else {
            info!("Metrics disabled");
            None
        };

        let mut bridges = Vec::with_capacity(self.config.bridges.len());
        for (name, settings) in &self.config.bridges {
            bridges.push(Bridge::new(name, settings, metrics.clone()).await?);
        }

        let cancel = CancellationToken::new();
        let (failure_tx, mut failure_rx) = mpsc::unbounded_channel::<BridgeError>();

        let metrics_handle = metrics.map(|registry| {
            let server = MetricsServer::new(registry, self.config.metrics_listen_addr);
            let cancel = cancel.clone();
            tokio::spawn(async move {
                if let Err(e) = server.run(cancel).await {
                    warn!(error = %e, "Metrics server error");
                }
            })
        });

        let handles: Vec<_> = bridges
            .into_iter()
            .map(|bridge| tokio::spawn(bridge.run(cancel.clone(), failure_tx.clone())))
            .collect();
        drop(failure_tx);

        info!("All bridges running");

        let outcome = tokio::select! {
            _ = shutdown => {
                info!("Shutdown requested");
                Ok(())
            }
            failure = failure_rx.recv() => match failure {
                Some(e) if e.is_partner_fault() => {
                    error!(error = %e, "Partner is misconfigured, shutting down");
                    Err(e)
                }
                Some(e) => {
                    error!(error = %e, "Fatal bridge error, shutting down");
                    Err(e)
                }
                None => Ok(()),
            },
        };

        cancel.cancel();
        futures::future::join_all(handles).await;
        if let Some(handle) = metrics_handle {
            let _ = handle.await;
        }

        info!("Bridge server stopped");
        outcome
    }
}

/// Resolves on SIGINT or SIGTERM
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
