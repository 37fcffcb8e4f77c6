//! State shared between the tasks of one bridge.

use crate::metrics::{MetricsObserver, MetricsRegistry};
use crate::reapply::ReapplyState;
use crate::types::BridgeStatus;
use async_trait::async_trait;
use tokio::sync::{Mutex, RwLock};

/// Status of a bridge and of its partner.
///
/// The event loop is the only writer. When both are needed, `status` is
/// locked before `partner_status`.
#[derive(Debug)]
pub struct SharedState {
    pub status: RwLock<BridgeStatus>,
    /// `None` until the partner answered a poll
    pub partner_status: RwLock<Option<BridgeStatus>>,
    pub reapply: Mutex<ReapplyState>,
}

impl SharedState {
    pub fn new(status: BridgeStatus, reapply: ReapplyState) -> Self {
        Self {
            status: RwLock::new(status),
            partner_status: RwLock::new(None),
            reapply: Mutex::new(reapply),
        }
    }

    /// Copy of the local status
    pub async fn snapshot(&self) -> BridgeStatus {
        self.status.read().await.clone()
    }
}

#[async_trait]
impl MetricsObserver for SharedState {
    async fn observe(&self, metrics: &MetricsRegistry) {
        let status = self.status.read().await;
        let partner = self.partner_status.read().await;

        let partner_active = partner.as_ref().is_some_and(|p| p.active);
        let partner_up = partner.as_ref().is_some_and(|p| p.up);
        metrics.set_bridge(
            &status.name,
            status.active as i64 + partner_active as i64,
            status.up as i64 + partner_up as i64,
        );

        for (name, ifs) in &status.interfaces {
            metrics.set_tunnel_interface(&status.name, name, ifs.active, ifs.up);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Role;
    use chrono::Utc;

    #[tokio::test]
    async fn test_observer_counts_partner() {
        let now = Utc::now();
        let state = SharedState::new(
            BridgeStatus::new("vpn-1", Role::Active, ["wg0"], now),
            ReapplyState::default(),
        );
        {
            let mut status = state.status.write().await;
            status.active = true;
            status.up = true;
            status.interfaces.get_mut("wg0").unwrap().up = true;
        }
        let mut partner = BridgeStatus::new("vpn-1", Role::Standby, ["wg0"], now);
        partner.up = true;
        *state.partner_status.write().await = Some(partner);

        let metrics = MetricsRegistry::new(&[1.0, 10.0]);
        state.observe(&metrics).await;

        let mut text = String::new();
        prometheus_client::encoding::text::encode(&mut text, &metrics.registry).unwrap();
        assert!(text.contains("bridge_active{bridge=\"vpn-1\"} 1"));
        assert!(text.contains("bridge_up{bridge=\"vpn-1\"} 2"));
        assert!(text.contains("tunnel_interface_up{bridge=\"vpn-1\",tunnel_interface=\"wg0\"} 1"));
    }
}
