//! Partner bridge synchronization.

use super::Machine;
use crate::error::{BridgeError, Result};
use crate::event::Event;
use crate::metrics::scope;
use crate::types::{BridgeStatus, Role};
use chrono::{DateTime, Utc};
use monitor::Status;
use std::collections::VecDeque;
use tracing::{info, warn};

impl Machine {
    pub(super) async fn on_partner_poll_failure(
        &mut self,
        timestamp: DateTime<Utc>,
        sequence: u64,
        error: &str,
        derived: &mut VecDeque<Event>,
    ) {
        warn!(
            bridge = %self.name,
            sequence,
            error = %error,
            "Failed to poll partner status"
        );
        self.record_error(scope::PARTNER_POLLING);

        self.derive_partner(timestamp, sequence, None, Status::Down, derived)
            .await;
    }

    pub(super) async fn on_partner_poll_success(
        &mut self,
        timestamp: DateTime<Utc>,
        sequence: u64,
        status: &BridgeStatus,
        derived: &mut VecDeque<Event>,
    ) -> Result<()> {
        if status.name != self.name {
            return Err(BridgeError::PartnerNameMismatch {
                ours: self.name.clone(),
                partner: status.name.clone(),
            });
        }
        if status.role == self.role {
            return Err(BridgeError::PartnerRoleIdentical(self.role));
        }

        let verdict = if status.up { Status::Up } else { Status::Down };
        self.derive_partner(timestamp, sequence, Some(status), verdict, derived)
            .await;
        Ok(())
    }

    /// Feed the partner monitor and mirror whatever the partner reported
    async fn derive_partner(
        &mut self,
        timestamp: DateTime<Utc>,
        sequence: u64,
        reported: Option<&BridgeStatus>,
        verdict: Status,
        derived: &mut VecDeque<Event>,
    ) {
        let mut partner = self.state.partner_status.write().await;

        // first contact: adopt as the baseline
        if partner.is_none() {
            match reported {
                Some(status) => *partner = Some(status.clone()),
                None => return,
            }
        }
        let Some(partner) = partner.as_mut() else {
            return;
        };

        self.partner_monitor.register_status(sequence, verdict);
        match self.partner_monitor.status() {
            Status::Down => {
                self.partner_confirmed = true;
                if partner.up {
                    partner.up = false;
                    partner.up_since = timestamp;
                    derived.push_back(Event::PartnerWentDown { timestamp });
                }
            }
            // the adopted baseline may already claim up; confirm it once
            Status::Up if !partner.up || !self.partner_confirmed => {
                self.partner_confirmed = true;
                partner.up = true;
                partner.up_since = timestamp;
                derived.push_back(Event::PartnerWentUp { timestamp });
            }
            _ => {}
        }

        let Some(status) = reported else {
            return;
        };

        partner.interfaces = status.interfaces.clone();

        if partner.name != status.name {
            derived.push_back(Event::PartnerChangedName {
                timestamp,
                from: partner.name.clone(),
                to: status.name.clone(),
            });
            partner.name = status.name.clone();
        }

        if partner.active != status.active {
            partner.active = status.active;
            partner.active_since = status.active_since;
            if status.active {
                derived.push_back(Event::PartnerActivated { timestamp });
            } else {
                derived.push_back(Event::PartnerDeactivated { timestamp });
            }
        }
    }

    pub(super) async fn on_partner_went_down(
        &self,
        timestamp: DateTime<Utc>,
        derived: &mut VecDeque<Event>,
    ) {
        info!(bridge = %self.name, "Partner went down");

        let mut status = self.state.status.write().await;
        let mut partner = self.state.partner_status.write().await;

        if let Some(partner) = partner.as_mut() {
            if partner.active {
                partner.active = false;
                partner.active_since = timestamp;
                derived.push_back(Event::PartnerDeactivated { timestamp });
            }
        }

        if !status.active {
            status.active = true;
            status.active_since = timestamp;
            derived.push_back(Event::BridgeActivated { timestamp });
        }
    }

    pub(super) async fn on_partner_went_up(
        &self,
        timestamp: DateTime<Utc>,
        derived: &mut VecDeque<Event>,
    ) {
        info!(bridge = %self.name, "Partner went up");

        let mut status = self.state.status.write().await;

        if status.active && self.role != Role::Active {
            status.active = false;
            status.active_since = timestamp;
            derived.push_back(Event::BridgeDeactivated { timestamp });
        }
    }
}
