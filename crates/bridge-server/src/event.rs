//! Events flowing through a bridge's event bus.
//!
//! Every event is stamped with the time it was produced. Events carrying a
//! `interface` field refer to a tunnel interface of the local bridge.

use crate::types::BridgeStatus;
use chrono::{DateTime, Utc};
use std::time::Duration;
use transponder::Location;

/// Bridge event
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    BridgeActivated {
        timestamp: DateTime<Utc>,
    },
    BridgeDeactivated {
        timestamp: DateTime<Utc>,
    },
    BridgeReactivated {
        timestamp: DateTime<Utc>,
        iteration: u32,
    },
    BridgeWentDown {
        timestamp: DateTime<Utc>,
    },
    BridgeWentUp {
        timestamp: DateTime<Utc>,
    },

    ConnectivityLost {
        timestamp: DateTime<Utc>,
    },
    ConnectivityRestored {
        timestamp: DateTime<Utc>,
    },

    PartnerActivated {
        timestamp: DateTime<Utc>,
    },
    PartnerDeactivated {
        timestamp: DateTime<Utc>,
    },
    PartnerChangedName {
        timestamp: DateTime<Utc>,
        from: String,
        to: String,
    },
    PartnerPollFailure {
        timestamp: DateTime<Utc>,
        sequence: u64,
        error: String,
    },
    PartnerPollSuccess {
        timestamp: DateTime<Utc>,
        sequence: u64,
        status: Box<BridgeStatus>,
    },
    PartnerWentDown {
        timestamp: DateTime<Utc>,
    },
    PartnerWentUp {
        timestamp: DateTime<Utc>,
    },

    TunnelInterfaceActivated {
        timestamp: DateTime<Utc>,
        interface: String,
    },
    TunnelInterfaceDeactivated {
        timestamp: DateTime<Utc>,
        interface: String,
    },
    TunnelInterfaceReactivated {
        timestamp: DateTime<Utc>,
        interface: String,
        iteration: u32,
    },
    TunnelInterfaceWentDown {
        timestamp: DateTime<Utc>,
        interface: String,
    },
    TunnelInterfaceWentUp {
        timestamp: DateTime<Utc>,
        interface: String,
    },

    TunnelProbeReturnFailure {
        timestamp: DateTime<Utc>,
        interface: String,
        sequence: u64,
    },
    TunnelProbeReturnSuccess {
        timestamp: DateTime<Utc>,
        interface: String,
        sequence: u64,
        latency_forward: Duration,
        latency_return: Duration,
        location: Location,
    },
    TunnelProbeSendFailure {
        timestamp: DateTime<Utc>,
        interface: String,
        sequence: u64,
        error: String,
    },
    TunnelProbeSendSuccess {
        timestamp: DateTime<Utc>,
        interface: String,
        sequence: u64,
    },
}

impl Event {
    /// Short snake_case name, used as a log field
    pub fn kind(&self) -> &'static str {
        match self {
            Event::BridgeActivated { .. } => "bridge_activated",
            Event::BridgeDeactivated { .. } => "bridge_deactivated",
            Event::BridgeReactivated { .. } => "bridge_reactivated",
            Event::BridgeWentDown { .. } => "bridge_went_down",
            Event::BridgeWentUp { .. } => "bridge_went_up",
            Event::ConnectivityLost { .. } => "connectivity_lost",
            Event::ConnectivityRestored { .. } => "connectivity_restored",
            Event::PartnerActivated { .. } => "partner_activated",
            Event::PartnerDeactivated { .. } => "partner_deactivated",
            Event::PartnerChangedName { .. } => "partner_changed_name",
            Event::PartnerPollFailure { .. } => "partner_poll_failure",
            Event::PartnerPollSuccess { .. } => "partner_poll_success",
            Event::PartnerWentDown { .. } => "partner_went_down",
            Event::PartnerWentUp { .. } => "partner_went_up",
            Event::TunnelInterfaceActivated { .. } => "tunnel_interface_activated",
            Event::TunnelInterfaceDeactivated { .. } => "tunnel_interface_deactivated",
            Event::TunnelInterfaceReactivated { .. } => "tunnel_interface_reactivated",
            Event::TunnelInterfaceWentDown { .. } => "tunnel_interface_went_down",
            Event::TunnelInterfaceWentUp { .. } => "tunnel_interface_went_up",
            Event::TunnelProbeReturnFailure { .. } => "tunnel_probe_return_failure",
            Event::TunnelProbeReturnSuccess { .. } => "tunnel_probe_return_success",
            Event::TunnelProbeSendFailure { .. } => "tunnel_probe_send_failure",
            Event::TunnelProbeSendSuccess { .. } => "tunnel_probe_send_success",
        }
    }

    /// When the event was produced
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Event::BridgeActivated { timestamp }
            | Event::BridgeDeactivated { timestamp }
            | Event::BridgeReactivated { timestamp, .. }
            | Event::BridgeWentDown { timestamp }
            | Event::BridgeWentUp { timestamp }
            | Event::ConnectivityLost { timestamp }
            | Event::ConnectivityRestored { timestamp }
            | Event::PartnerActivated { timestamp }
            | Event::PartnerDeactivated { timestamp }
            | Event::PartnerChangedName { timestamp, .. }
            | Event::PartnerPollFailure { timestamp, .. }
            | Event::PartnerPollSuccess { timestamp, .. }
            | Event::PartnerWentDown { timestamp }
            | Event::PartnerWentUp { timestamp }
            | Event::TunnelInterfaceActivated { timestamp, .. }
            | Event::TunnelInterfaceDeactivated { timestamp, .. }
            | Event::TunnelInterfaceReactivated { timestamp, .. }
            | Event::TunnelInterfaceWentDown { timestamp, .. }
            | Event::TunnelInterfaceWentUp { timestamp, .. }
            | Event::TunnelProbeReturnFailure { timestamp, .. }
            | Event::TunnelProbeReturnSuccess { timestamp, .. }
            | Event::TunnelProbeSendFailure { timestamp, .. }
            | Event::TunnelProbeSendSuccess { timestamp, .. } => *timestamp,
        }
    }

    /// Tunnel interface the event refers to, if any
    pub fn tunnel_interface(&self) -> Option<&str> {
        match self {
            Event::TunnelInterfaceActivated { interface, .. }
            | Event::TunnelInterfaceDeactivated { interface, .. }
            | Event::TunnelInterfaceReactivated { interface, .. }
            | Event::TunnelInterfaceWentDown { interface, .. }
            | Event::TunnelInterfaceWentUp { interface, .. }
            | Event::TunnelProbeReturnFailure { interface, .. }
            | Event::TunnelProbeReturnSuccess { interface, .. }
            | Event::TunnelProbeSendFailure { interface, .. }
            | Event::TunnelProbeSendSuccess { interface, .. } => Some(interface),
            _ => None,
        }
    }
}
