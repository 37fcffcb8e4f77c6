//! Event-driven state machine of a bridge.
//!
//! The machine is the single consumer of the bridge's event queue and the
//! only writer of its [`SharedState`]. Handling an event may derive further
//! events; those are processed in FIFO order before the next queued event is
//! taken, so the machine never feeds its own bounded channel.

mod bridge;
mod partner;
mod tunnel;

use crate::config::BridgeSettings;
use crate::error::{BridgeError, Result};
use crate::event::Event;
use crate::metrics::{MetricsRegistry, scope};
use crate::reconciler::{BridgeActivation, InterfaceActivation, Reconciler};
use crate::state::SharedState;
use crate::types::{Cidr, Role};
use monitor::{MAX_THRESHOLD, Monitor};
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};
use transponder::Location;

/// State machine of one bridge
pub struct Machine {
    name: String,
    role: Role,
    bridge_interface: String,
    peer_cidrs: Vec<Cidr>,
    location: Location,
    interface_roles: BTreeMap<String, Role>,
    monitors: BTreeMap<String, Monitor>,
    partner_monitor: Monitor,
    /// Set once the partner monitor produced its first verdict
    partner_confirmed: bool,
    state: Arc<SharedState>,
    reconciler: Arc<dyn Reconciler>,
    metrics: Option<Arc<MetricsRegistry>>,
}

impl Machine {
    /// Create the machine of bridge `name`
    ///
    /// A standby bridge judges its partner with thresholds one higher than
    /// configured, so that the active side wins when both see changes at
    /// the same time.
    pub fn new(
        name: &str,
        settings: &BridgeSettings,
        state: Arc<SharedState>,
        reconciler: Arc<dyn Reconciler>,
        metrics: Option<Arc<MetricsRegistry>>,
    ) -> Result<Self> {
        let mut monitors = BTreeMap::new();
        let mut interface_roles = BTreeMap::new();
        for (interface, ifs) in &settings.tunnel_interfaces {
            let monitor = Monitor::new(ifs.threshold_down, ifs.threshold_up).map_err(|source| {
                BridgeError::Monitor {
                    subject: interface.clone(),
                    source,
                }
            })?;
            monitors.insert(interface.clone(), monitor);
            interface_roles.insert(interface.clone(), ifs.role);
        }

        let bump = match settings.role {
            Role::Active => 0,
            Role::Standby => 1,
        };
        let partner_monitor = Monitor::new(
            (settings.partner_status_threshold_down + bump).min(MAX_THRESHOLD),
            (settings.partner_status_threshold_up + bump).min(MAX_THRESHOLD),
        )
        .map_err(|source| BridgeError::Monitor {
            subject: "partner".to_string(),
            source,
        })?;

        let location = settings
            .location(name)
            .map_err(|e| BridgeError::InvalidSettings(e.to_string()))?;

        Ok(Self {
            name: name.to_string(),
            role: settings.role,
            bridge_interface: settings.bridge_interface.clone(),
            peer_cidrs: settings.peer_cidrs.clone(),
            location,
            interface_roles,
            monitors,
            partner_monitor,
            partner_confirmed: false,
            state,
            reconciler,
            metrics,
        })
    }

    /// Bridge name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Shared state written by this machine
    pub fn state(&self) -> &Arc<SharedState> {
        &self.state
    }

    /// Handle `event` and everything derived from it.
    ///
    /// Returns the derived events in the order they were processed. A fatal
    /// error stops the cascade.
    pub async fn process(&mut self, event: Event) -> Result<Vec<Event>> {
        let mut derived = VecDeque::new();
        let mut processed = Vec::new();

        self.handle(&event, &mut derived).await?;
        while let Some(event) = derived.pop_front() {
            self.handle(&event, &mut derived).await?;
            processed.push(event);
        }

        Ok(processed)
    }

    /// Consume events until cancelled or the queue is closed.
    ///
    /// Fatal errors go to `failures`; the loop keeps running until the
    /// server cancels it.
    pub async fn run(
        mut self,
        mut events: mpsc::Receiver<Event>,
        failures: mpsc::UnboundedSender<BridgeError>,
        cancel: CancellationToken,
    ) {
        info!(bridge = %self.name, "Bridge event loop started");

        loop {
            let event = tokio::select! {
                _ = cancel.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            if let Err(e) = self.process(event).await {
                error!(bridge = %self.name, error = %e, "Fatal bridge error");
                if failures.send(e).is_err() {
                    break;
                }
            }
        }

        info!(bridge = %self.name, "Bridge event loop stopped");
    }

    async fn handle(&mut self, event: &Event, derived: &mut VecDeque<Event>) -> Result<()> {
        debug!(
            bridge = %self.name,
            kind = event.kind(),
            tunnel_interface = event.tunnel_interface(),
            "Processing event"
        );

        match event {
            Event::BridgeActivated { timestamp } => self.on_bridge_activated(*timestamp).await,
            Event::BridgeDeactivated { .. } => self.on_bridge_deactivated().await,
            Event::BridgeReactivated {
                timestamp,
                iteration,
            } => self.on_bridge_reactivated(*timestamp, *iteration).await,
            Event::BridgeWentDown { timestamp } => {
                self.on_bridge_went_down(*timestamp, derived).await
            }
            Event::BridgeWentUp { timestamp } => self.on_bridge_went_up(*timestamp, derived).await,

            Event::ConnectivityLost { .. } => {
                info!(bridge = %self.name, "Connectivity lost");
            }
            Event::ConnectivityRestored { .. } => {
                info!(bridge = %self.name, "Connectivity restored");
            }

            Event::PartnerActivated { .. } => {
                info!(bridge = %self.name, "Partner activated");
            }
            Event::PartnerDeactivated { .. } => {
                info!(bridge = %self.name, "Partner deactivated");
            }
            Event::PartnerChangedName { from, to, .. } => {
                return Err(BridgeError::PartnerChangedName {
                    from: from.clone(),
                    to: to.clone(),
                });
            }
            Event::PartnerPollFailure {
                timestamp,
                sequence,
                error,
            } => {
                self.on_partner_poll_failure(*timestamp, *sequence, error, derived)
                    .await
            }
            Event::PartnerPollSuccess {
                timestamp,
                sequence,
                status,
            } => {
                self.on_partner_poll_success(*timestamp, *sequence, status, derived)
                    .await?
            }
            Event::PartnerWentDown { timestamp } => {
                self.on_partner_went_down(*timestamp, derived).await
            }
            Event::PartnerWentUp { timestamp } => self.on_partner_went_up(*timestamp, derived).await,

            Event::TunnelInterfaceActivated {
                timestamp,
                interface,
            } => self.on_tunnel_interface_activated(*timestamp, interface).await,
            Event::TunnelInterfaceDeactivated { interface, .. } => {
                self.on_tunnel_interface_deactivated(interface).await
            }
            Event::TunnelInterfaceReactivated {
                timestamp,
                interface,
                iteration,
            } => {
                self.on_tunnel_interface_reactivated(*timestamp, interface, *iteration)
                    .await
            }
            Event::TunnelInterfaceWentDown {
                timestamp,
                interface,
            } => {
                self.on_tunnel_interface_went_down(*timestamp, interface, derived)
                    .await
            }
            Event::TunnelInterfaceWentUp {
                timestamp,
                interface,
            } => {
                self.on_tunnel_interface_went_up(*timestamp, interface, derived)
                    .await
            }

            Event::TunnelProbeReturnFailure {
                timestamp,
                interface,
                sequence,
            } => {
                self.on_probe_return_failure(*timestamp, interface, *sequence, derived)
                    .await
            }
            Event::TunnelProbeReturnSuccess {
                timestamp,
                interface,
                sequence,
                latency_forward,
                latency_return,
                location,
            } => {
                if let Some(metrics) = &self.metrics {
                    metrics.record_probe_returned(
                        &self.name,
                        interface,
                        self.location.as_str(),
                        location.as_str(),
                        *latency_forward,
                        *latency_return,
                    );
                }
                self.on_probe_return_success(*timestamp, interface, *sequence, derived)
                    .await
            }
            Event::TunnelProbeSendFailure {
                timestamp,
                interface,
                sequence,
                error,
            } => {
                self.on_probe_send_failure(*timestamp, interface, *sequence, error, derived)
                    .await
            }
            Event::TunnelProbeSendSuccess {
                timestamp,
                interface,
                sequence,
            } => {
                self.on_probe_send_success(*timestamp, interface, *sequence, derived)
                    .await
            }
        }

        Ok(())
    }

    fn bridge_activation(&self, iteration: u32) -> BridgeActivation {
        BridgeActivation {
            bridge_interface: self.bridge_interface.clone(),
            peer_cidrs: self.peer_cidrs.clone(),
            iteration,
        }
    }

    fn interface_activation(&self, interface: &str, iteration: u32) -> InterfaceActivation {
        InterfaceActivation {
            bridge_interface: self.bridge_interface.clone(),
            peer_cidrs: self.peer_cidrs.clone(),
            tunnel_interface: interface.to_string(),
            iteration,
        }
    }

    fn record_error(&self, scope: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.record_error(&self.name, scope);
        }
    }

    fn unknown_interface(&self, interface: &str) {
        error!(
            bridge = %self.name,
            tunnel_interface = %interface,
            "Event for unknown tunnel interface"
        );
        self.record_error(scope::INTERNAL_LOGIC);
    }
}
