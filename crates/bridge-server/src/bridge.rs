//! Runtime of a single bridge: transponders, event loop, ticker, status
//! endpoint and script executor.

use crate::config::BridgeSettings;
use crate::error::{BridgeError, Result};
use crate::event::Event;
use crate::http_server::StatusServer;
use crate::machine::Machine;
use crate::metrics::{MetricsRegistry, scope};
use crate::partner::PartnerPoller;
use crate::probing::Prober;
use crate::reapply::ReapplyState;
use crate::reconciler::{Executor, Reconciler, ScriptReconciler, interface_ip};
use crate::state::SharedState;
use crate::ticker::Ticker;
use crate::types::BridgeStatus;
use chrono::Utc;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use transponder::{ProbeHandler, Transponder};

/// A fully wired bridge, ready to run
pub struct Bridge {
    name: String,
    state: Arc<SharedState>,
    prober: Arc<Prober>,
    machine: Machine,
    events: mpsc::Receiver<Event>,
    ticker: Ticker,
    status_server: StatusServer,
    status_addr: SocketAddr,
    executor: Option<Executor>,
    metrics: Option<Arc<MetricsRegistry>>,
}

impl Bridge {
    /// Build bridge `name` with a script reconciler
    pub async fn new(
        name: &str,
        settings: &BridgeSettings,
        metrics: Option<Arc<MetricsRegistry>>,
    ) -> Result<Self> {
        let (reconciler, executor) = ScriptReconciler::new(name, settings, metrics.clone());
        Self::build(name, settings, Arc::new(reconciler), Some(executor), metrics).await
    }

    /// Build bridge `name` around an existing reconciler
    pub async fn with_reconciler(
        name: &str,
        settings: &BridgeSettings,
        reconciler: Arc<dyn Reconciler>,
        metrics: Option<Arc<MetricsRegistry>>,
    ) -> Result<Self> {
        Self::build(name, settings, reconciler, None, metrics).await
    }

    async fn build(
        name: &str,
        settings: &BridgeSettings,
        reconciler: Arc<dyn Reconciler>,
        executor: Option<Executor>,
        metrics: Option<Arc<MetricsRegistry>>,
    ) -> Result<Self> {
        let location = settings
            .location(name)
            .map_err(|e| BridgeError::InvalidSettings(e.to_string()))?;

        let capacity = 2 * settings.tunnel_interfaces.len().max(1);
        let (tx, rx) = mpsc::channel(capacity);

        let status = BridgeStatus::new(
            name,
            settings.role,
            settings.tunnel_interfaces.keys().map(String::as_str),
            Utc::now(),
        );
        let reapply = ReapplyState::new(
            settings.reconcile.bridge_activate.reapply.policy(),
            settings.reconcile.interface_activate.reapply.policy(),
        );
        let state = Arc::new(SharedState::new(status, reapply));

        let mut prober = Prober::new(name, location, tx.clone(), metrics.clone());
        for (interface, ifs) in &settings.tunnel_interfaces {
            let transponder = Arc::new(Transponder::new(interface.as_str(), ifs.addr));
            transponder.connect().await?;
            prober.add_interface(transponder, ifs.probe_addr);
        }
        let prober = Arc::new(prober);

        let local_ip = match &settings.partner_polling_interface {
            Some(interface) => Some(polling_ip(interface)?),
            None => None,
        };
        let poller = PartnerPoller::new(&settings.partner_url, settings.partner_status_timeout, local_ip)?;

        let machine = Machine::new(name, settings, state.clone(), reconciler, metrics.clone())?;

        let status_server = StatusServer::bind(name, settings.status_addr, state.clone()).await?;
        let status_addr = status_server
            .local_addr()
            .map_err(|source| BridgeError::StatusServer {
                addr: settings.status_addr,
                source,
            })?;

        let ticker = Ticker::new(
            name,
            settings.probe_interval,
            prober.clone(),
            poller,
            state.clone(),
            tx,
        );

        if let Some(registry) = &metrics {
            registry.register_observer(state.clone()).await;
        }

        info!(
            bridge = %name,
            role = %settings.role,
            uuid = %prober.uuid(),
            tunnel_interfaces = settings.tunnel_interfaces.len(),
            "Bridge created"
        );

        Ok(Self {
            name: name.to_string(),
            state,
            prober,
            machine,
            events: rx,
            ticker,
            status_server,
            status_addr,
            executor,
            metrics,
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn state(&self) -> Arc<SharedState> {
        self.state.clone()
    }

    /// Address the status endpoint is actually bound to
    pub fn status_addr(&self) -> SocketAddr {
        self.status_addr
    }

    /// Run every task of the bridge until `cancel` fires.
    ///
    /// Fatal faults are reported on `failures`; it is up to the owner to
    /// cancel.
    pub async fn run(self, cancel: CancellationToken, failures: mpsc::UnboundedSender<BridgeError>) {
        info!(bridge = %self.name, "Bridge starting");

        let mut tasks = Vec::new();

        let handler: Arc<dyn ProbeHandler> = self.prober.clone();
        for transponder in self.prober.transponders() {
            let transponder = transponder.clone();
            let handler = handler.clone();
            let cancel = cancel.clone();
            let failures = failures.clone();
            tasks.push(tokio::spawn(async move {
                if let Err(e) = transponder.run(handler, cancel).await {
                    let _ = failures.send(e.into());
                }
            }));
        }

        if let Some(executor) = self.executor {
            tasks.push(tokio::spawn(executor.run(cancel.clone())));
        }

        let name = self.name.clone();
        let metrics = self.metrics.clone();
        let server_cancel = cancel.clone();
        let status_server = self.status_server;
        tasks.push(tokio::spawn(async move {
            if let Err(e) = status_server.run(server_cancel).await {
                error!(bridge = %name, error = %e, "Status server failed");
                if let Some(metrics) = metrics {
                    metrics.record_error(&name, scope::STATUS_LISTENER);
                }
            }
        }));

        tasks.push(tokio::spawn(self.machine.run(
            self.events,
            failures,
            cancel.clone(),
        )));

        self.ticker.run(cancel).await;

        for transponder in self.prober.transponders() {
            transponder.stop().await;
        }
        for task in futures::future::join_all(tasks).await {
            if let Err(e) = task {
                warn!(bridge = %self.name, error = %e, "Bridge task panicked");
            }
        }

        info!(bridge = %self.name, "Bridge stopped");
    }
}

/// Source address for partner polls: IPv4 if the interface has one
fn polling_ip(interface: &str) -> Result<IpAddr> {
    let ip = interface_ip(interface, true).or_else(|_| interface_ip(interface, false))?;
    Ok(ip)
}
