//! Tunnel interface rules: probe accounting and interface election.

use super::Machine;
use crate::event::Event;
use crate::metrics::scope;
use crate::types::Role;
use chrono::{DateTime, Utc};
use monitor::Status;
use std::collections::VecDeque;
use tracing::{debug, info, warn};

impl Machine {
    pub(super) async fn on_probe_send_success(
        &mut self,
        timestamp: DateTime<Utc>,
        interface: &str,
        sequence: u64,
        derived: &mut VecDeque<Event>,
    ) {
        if let Some(metrics) = &self.metrics {
            metrics.record_probe_sent(&self.name, interface);
        }

        let Some(monitor) = self.monitors.get_mut(interface) else {
            return self.unknown_interface(interface);
        };
        // the probe may have returned already; never overwrite its result
        if sequence > monitor.sequence() {
            monitor.register_status(sequence, Status::Pending);
        }

        self.detect_tunnel_up_down(timestamp, interface, derived).await;
    }

    pub(super) async fn on_probe_send_failure(
        &mut self,
        timestamp: DateTime<Utc>,
        interface: &str,
        sequence: u64,
        error: &str,
        derived: &mut VecDeque<Event>,
    ) {
        warn!(
            bridge = %self.name,
            tunnel_interface = %interface,
            sequence,
            error = %error,
            "Failed to send probe"
        );
        if let Some(metrics) = &self.metrics {
            metrics.record_probe_failed(&self.name, interface);
            metrics.record_error(&self.name, scope::PEER_PROBING);
        }

        self.register(timestamp, interface, sequence, Status::Down, derived)
            .await;
    }

    pub(super) async fn on_probe_return_success(
        &mut self,
        timestamp: DateTime<Utc>,
        interface: &str,
        sequence: u64,
        derived: &mut VecDeque<Event>,
    ) {
        self.register(timestamp, interface, sequence, Status::Up, derived)
            .await;
    }

    pub(super) async fn on_probe_return_failure(
        &mut self,
        timestamp: DateTime<Utc>,
        interface: &str,
        sequence: u64,
        derived: &mut VecDeque<Event>,
    ) {
        debug!(
            bridge = %self.name,
            tunnel_interface = %interface,
            sequence,
            "Probe did not return"
        );
        if let Some(metrics) = &self.metrics {
            metrics.record_probe_failed(&self.name, interface);
        }

        self.register(timestamp, interface, sequence, Status::Down, derived)
            .await;
    }

    async fn register(
        &mut self,
        timestamp: DateTime<Utc>,
        interface: &str,
        sequence: u64,
        status: Status,
        derived: &mut VecDeque<Event>,
    ) {
        let Some(monitor) = self.monitors.get_mut(interface) else {
            return self.unknown_interface(interface);
        };
        monitor.register_status(sequence, status);

        self.detect_tunnel_up_down(timestamp, interface, derived).await;
    }

    /// Turn the monitor's verdict into tunnel up/down transitions
    async fn detect_tunnel_up_down(
        &self,
        timestamp: DateTime<Utc>,
        interface: &str,
        derived: &mut VecDeque<Event>,
    ) {
        let Some(verdict) = self.monitors.get(interface).map(|m| m.status()) else {
            return;
        };

        let mut status = self.state.status.write().await;
        let Some(ifs) = status.interfaces.get_mut(interface) else {
            return;
        };

        match verdict {
            Status::Down if ifs.up => {
                ifs.up = false;
                ifs.up_since = timestamp;
                derived.push_back(Event::TunnelInterfaceWentDown {
                    timestamp,
                    interface: interface.to_string(),
                });
            }
            Status::Up if !ifs.up => {
                ifs.up = true;
                ifs.up_since = timestamp;
                derived.push_back(Event::TunnelInterfaceWentUp {
                    timestamp,
                    interface: interface.to_string(),
                });
            }
            _ => {}
        }
    }

    /// Hand the active role over to the first other interface that is up
    pub(super) async fn on_tunnel_interface_went_down(
        &self,
        timestamp: DateTime<Utc>,
        interface: &str,
        derived: &mut VecDeque<Event>,
    ) {
        info!(bridge = %self.name, tunnel_interface = %interface, "Tunnel interface went down");

        self.derive_bridge_events(timestamp, derived).await;

        let mut status = self.state.status.write().await;
        let Some(ifs) = status.interfaces.get_mut(interface) else {
            return;
        };
        if !ifs.active {
            return;
        }

        ifs.active = false;
        ifs.active_since = timestamp;
        derived.push_back(Event::TunnelInterfaceDeactivated {
            timestamp,
            interface: interface.to_string(),
        });

        let promoted = status
            .interfaces
            .iter_mut()
            .find(|(name, ifs)| name.as_str() != interface && ifs.up);
        if let Some((name, ifs)) = promoted {
            ifs.active = true;
            ifs.active_since = timestamp;
            derived.push_back(Event::TunnelInterfaceActivated {
                timestamp,
                interface: name.clone(),
            });
        }
    }

    /// An active-role interface takes over; a standby one only fills a gap
    pub(super) async fn on_tunnel_interface_went_up(
        &self,
        timestamp: DateTime<Utc>,
        interface: &str,
        derived: &mut VecDeque<Event>,
    ) {
        info!(bridge = %self.name, tunnel_interface = %interface, "Tunnel interface went up");

        self.derive_bridge_events(timestamp, derived).await;

        let Some(role) = self.interface_roles.get(interface).copied() else {
            return;
        };

        let mut status = self.state.status.write().await;
        let Some(already_active) = status.interfaces.get(interface).map(|ifs| ifs.active) else {
            return;
        };
        if already_active {
            return;
        }

        match role {
            Role::Active => {
                for (name, ifs) in status.interfaces.iter_mut() {
                    if name.as_str() == interface || !ifs.active {
                        continue;
                    }
                    ifs.active = false;
                    ifs.active_since = timestamp;
                    derived.push_back(Event::TunnelInterfaceDeactivated {
                        timestamp,
                        interface: name.clone(),
                    });
                }
            }
            Role::Standby => {
                if status.interfaces.values().any(|ifs| ifs.active) {
                    return;
                }
            }
        }

        if let Some(ifs) = status.interfaces.get_mut(interface) {
            ifs.active = true;
            ifs.active_since = timestamp;
            derived.push_back(Event::TunnelInterfaceActivated {
                timestamp,
                interface: interface.to_string(),
            });
        }
    }

    pub(super) async fn on_tunnel_interface_activated(&self, timestamp: DateTime<Utc>, interface: &str) {
        info!(bridge = %self.name, tunnel_interface = %interface, "Tunnel interface activating");

        self.reconciler
            .interface_activate(&self.interface_activation(interface, 0));

        if let Some(reapply) = self.state.reapply.lock().await.interface.as_mut() {
            reapply.arm(timestamp);
        }
    }

    pub(super) async fn on_tunnel_interface_deactivated(&self, interface: &str) {
        info!(bridge = %self.name, tunnel_interface = %interface, "Tunnel interface deactivating");

        self.reconciler
            .interface_deactivate(&self.interface_activation(interface, 0));

        if let Some(reapply) = self.state.reapply.lock().await.interface.as_mut() {
            reapply.disarm();
        }
    }

    pub(super) async fn on_tunnel_interface_reactivated(
        &self,
        timestamp: DateTime<Utc>,
        interface: &str,
        iteration: u32,
    ) {
        let still_active = self
            .state
            .status
            .read()
            .await
            .interfaces
            .get(interface)
            .is_some_and(|ifs| ifs.active);
        if !still_active {
            info!(
                bridge = %self.name,
                tunnel_interface = %interface,
                "Skipping tunnel interface reactivation since it is inactive by now"
            );
            return;
        }

        info!(
            bridge = %self.name,
            tunnel_interface = %interface,
            iteration,
            "Tunnel interface reactivating"
        );

        self.reconciler
            .interface_activate(&self.interface_activation(interface, iteration));

        if let Some(reapply) = self.state.reapply.lock().await.interface.as_mut() {
            reapply.advance(timestamp);
        }
    }
}
