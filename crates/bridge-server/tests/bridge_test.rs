//! End-to-end test: an active and a standby bridge on loopback
//!
//! Both bridges probe each other over a single tunnel interface and poll
//! each other's status endpoint; they must settle with exactly the active
//! one carrying traffic.

use bridge_server::config::Config;
use bridge_server::reconciler::{BridgeActivation, InterfaceActivation, Reconciler};
use axum::{Json, Router, routing::get};
use bridge_server::{Bridge, BridgeError, BridgeServer, BridgeStatus, Role, SharedState};
use chrono::Utc;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Counts bridge activations
#[derive(Default)]
struct CountingReconciler {
    bridge_activations: AtomicUsize,
}

impl Reconciler for CountingReconciler {
    fn bridge_activate(&self, _: &BridgeActivation) {
        self.bridge_activations.fetch_add(1, Ordering::SeqCst);
    }

    fn interface_activate(&self, _: &InterfaceActivation) {}

    fn interface_deactivate(&self, _: &InterfaceActivation) {}
}

fn bridge_yaml(role: &str, status: u16, partner: u16, local: u16, remote: u16) -> String {
    format!(
        r#"
bridges:
  vpn-1:
    role: {role}
    bridge_interface: lo
    peer_cidrs: [10.1.0.0/16]
    status_addr: 127.0.0.1:{status}
    partner_url: http://127.0.0.1:{partner}
    partner_status_timeout: 100ms
    partner_status_threshold_down: 2
    partner_status_threshold_up: 2
    probe_interval: 100ms
    tunnel_interfaces:
      wg0:
        role: active
        addr: 127.0.0.1:{local}
        probe_addr: 127.0.0.1:{remote}
        threshold_down: 2
        threshold_up: 2
"#
    )
}

async fn wait_for(state: &SharedState, active: bool) -> bool {
    for _ in 0..100 {
        let status = state.snapshot().await;
        if status.up && status.active == active {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    }
    false
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_active_and_standby_settle() {
    let active_config = Config::from_yaml(&bridge_yaml("active", 47811, 47812, 47821, 47822)).unwrap();
    let standby_config = Config::from_yaml(&bridge_yaml("standby", 47812, 47811, 47822, 47821)).unwrap();

    let active_reconciler = Arc::new(CountingReconciler::default());
    let active = Bridge::with_reconciler(
        "vpn-1",
        &active_config.bridges["vpn-1"],
        active_reconciler.clone(),
        None,
    )
    .await
    .unwrap();
    let standby = Bridge::with_reconciler(
        "vpn-1",
        &standby_config.bridges["vpn-1"],
        Arc::new(CountingReconciler::default()),
        None,
    )
    .await
    .unwrap();

    let active_state = active.state();
    let standby_state = standby.state();

    let cancel = CancellationToken::new();
    let (failure_tx, mut failure_rx) = mpsc::unbounded_channel::<BridgeError>();
    let handles = vec![
        tokio::spawn(active.run(cancel.clone(), failure_tx.clone())),
        tokio::spawn(standby.run(cancel.clone(), failure_tx)),
    ];

    assert!(wait_for(&active_state, true).await, "active bridge never activated");
    assert!(wait_for(&standby_state, false).await, "standby bridge never settled");

    let partner = standby_state.partner_status.read().await.clone().unwrap();
    assert!(partner.up);
    assert!(partner.active);
    assert!(active_reconciler.bridge_activations.load(Ordering::SeqCst) >= 1);

    cancel.cancel();
    for handle in handles {
        handle.await.unwrap();
    }
    assert!(failure_rx.try_recv().is_err());
}

#[tokio::test]
async fn test_server_stops_on_partner_with_same_role() {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let partner = listener.local_addr().unwrap();
    let router = Router::new().route(
        "/status",
        get(|| async { Json(BridgeStatus::new("vpn-1", Role::Active, ["wg0"], Utc::now())) }),
    );
    tokio::spawn(async move {
        axum::serve(listener, router).await.unwrap();
    });

    let yaml = format!(
        "{}metrics:\n  enabled: false\n",
        bridge_yaml("active", 47831, partner.port(), 47832, 47833)
    );
    let config = Config::from_yaml(&yaml).unwrap();
    let server = BridgeServer::new(config.to_server_config());

    let outcome = tokio::time::timeout(
        Duration::from_secs(10),
        server.run_until(std::future::pending()),
    )
    .await
    .expect("server kept running with a misconfigured partner");

    let err = outcome.unwrap_err();
    assert!(err.is_partner_fault());
    assert!(matches!(err, BridgeError::PartnerRoleIdentical(Role::Active)));
}
