//! Bridge level rules: up/down derivation, election and reapply.

use super::Machine;
use crate::event::Event;
use crate::types::{BridgeStatus, Role};
use chrono::{DateTime, Utc};
use std::collections::VecDeque;
use tracing::info;

/// Whether the partner is known and currently considered up
pub(super) fn partner_up(partner: &Option<BridgeStatus>) -> bool {
    partner.as_ref().is_some_and(|p| p.up)
}

impl Machine {
    /// Recompute bridge liveness from its tunnel interfaces
    pub(super) async fn derive_bridge_events(
        &self,
        timestamp: DateTime<Utc>,
        derived: &mut VecDeque<Event>,
    ) {
        let mut status = self.state.status.write().await;

        let up = status.interfaces.values().any(|ifs| ifs.up);
        if up == status.up {
            return;
        }

        status.up = up;
        status.up_since = timestamp;
        if up {
            derived.push_back(Event::BridgeWentUp { timestamp });
        } else {
            derived.push_back(Event::BridgeWentDown { timestamp });
        }
    }

    pub(super) async fn on_bridge_went_down(
        &self,
        timestamp: DateTime<Utc>,
        derived: &mut VecDeque<Event>,
    ) {
        info!(bridge = %self.name, "Bridge went down");

        let mut status = self.state.status.write().await;
        let partner = self.state.partner_status.read().await;

        if status.active {
            status.active = false;
            status.active_since = timestamp;
            derived.push_back(Event::BridgeDeactivated { timestamp });
        }

        if !partner_up(&partner) {
            derived.push_back(Event::ConnectivityLost { timestamp });
        }
    }

    pub(super) async fn on_bridge_went_up(
        &self,
        timestamp: DateTime<Utc>,
        derived: &mut VecDeque<Event>,
    ) {
        info!(bridge = %self.name, "Bridge went up");

        let mut status = self.state.status.write().await;
        let partner = self.state.partner_status.read().await;
        let partner_up = partner_up(&partner);

        if !status.active {
            let activate = match self.role {
                Role::Active => true,
                Role::Standby => !partner_up,
            };
            if activate {
                status.active = true;
                status.active_since = timestamp;
                derived.push_back(Event::BridgeActivated { timestamp });
            }
        }

        if !partner_up {
            derived.push_back(Event::ConnectivityRestored { timestamp });
        }
    }

    pub(super) async fn on_bridge_activated(&self, timestamp: DateTime<Utc>) {
        info!(bridge = %self.name, "Bridge activating");

        self.reconciler.bridge_activate(&self.bridge_activation(0));

        if let Some(reapply) = self.state.reapply.lock().await.bridge.as_mut() {
            reapply.arm(timestamp);
        }
    }

    pub(super) async fn on_bridge_deactivated(&self) {
        info!(bridge = %self.name, "Bridge deactivated");

        if let Some(reapply) = self.state.reapply.lock().await.bridge.as_mut() {
            reapply.disarm();
        }
    }

    pub(super) async fn on_bridge_reactivated(&self, timestamp: DateTime<Utc>, iteration: u32) {
        if !self.state.status.read().await.active {
            info!(
                bridge = %self.name,
                "Skipping bridge reactivation since it is inactive by now"
            );
            return;
        }

        info!(bridge = %self.name, iteration, "Bridge reactivating");

        self.reconciler
            .bridge_activate(&self.bridge_activation(iteration));

        if let Some(reapply) = self.state.reapply.lock().await.bridge.as_mut() {
            reapply.advance(timestamp);
        }
    }
}
