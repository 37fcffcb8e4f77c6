//! Probe exchange glue between the transponders and the event bus.

use crate::event::Event;
use crate::metrics::{MetricsRegistry, scope};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};
use transponder::{Location, Peer, Probe, ProbeError, ProbeHandler, Transponder, TransponderError};
use uuid::Uuid;

/// Sends probes to the peers of a bridge and dispatches whatever comes back
pub struct Prober {
    bridge: String,
    uuid: Uuid,
    location: Location,
    peers: BTreeMap<String, Peer>,
    transponders: BTreeMap<String, Arc<Transponder>>,
    events: mpsc::Sender<Event>,
    metrics: Option<Arc<MetricsRegistry>>,
}

impl Prober {
    pub fn new(
        bridge: &str,
        location: Location,
        events: mpsc::Sender<Event>,
        metrics: Option<Arc<MetricsRegistry>>,
    ) -> Self {
        Self {
            bridge: bridge.to_string(),
            uuid: Uuid::new_v4(),
            location,
            peers: BTreeMap::new(),
            transponders: BTreeMap::new(),
            events,
            metrics,
        }
    }

    /// Probe `probe_addr` over `transponder`
    pub fn add_interface(&mut self, transponder: Arc<Transponder>, probe_addr: SocketAddr) {
        let interface = transponder.interface().to_string();
        self.peers
            .insert(interface.clone(), Peer::new(interface.clone(), probe_addr));
        self.transponders.insert(interface, transponder);
    }

    /// Identity of the bridge stamped into outgoing probes
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    pub fn peer(&self, interface: &str) -> Option<&Peer> {
        self.peers.get(interface)
    }

    pub fn transponders(&self) -> impl Iterator<Item = &Arc<Transponder>> {
        self.transponders.values()
    }

    /// Send one probe per tunnel interface.
    ///
    /// Sends are spawned; their outcome reaches the bus as
    /// `TunnelProbeSendSuccess` or `TunnelProbeSendFailure`.
    pub fn send_probes(&self) {
        for (interface, peer) in &self.peers {
            let Some(transponder) = self.transponders.get(interface) else {
                continue;
            };

            let probe = Probe::new(peer.next_sequence(), self.uuid, self.location, peer.uuid());
            let to = peer.probe_addr();
            let transponder = transponder.clone();
            let events = self.events.clone();
            let bridge = self.bridge.clone();
            let interface = interface.clone();

            tokio::spawn(async move {
                let timestamp = probe.src_timestamp;
                let sequence = probe.sequence;

                let event = match transponder.send(&probe, to).await {
                    Ok(()) => {
                        debug!(bridge = %bridge, tunnel_interface = %interface, sequence, "Sent probe");
                        Event::TunnelProbeSendSuccess {
                            timestamp,
                            interface,
                            sequence,
                        }
                    }
                    Err(TransponderError::ShuttingDown) => return,
                    Err(e) => Event::TunnelProbeSendFailure {
                        timestamp,
                        interface,
                        sequence,
                        error: e.to_string(),
                    },
                };
                let _ = events.send(event).await;
            });
        }
    }

    /// Report every probe older than the latest one that never came back
    pub async fn sweep(&self) {
        let timestamp = Utc::now();

        for (interface, peer) in &self.peers {
            for sequence in peer.sweep() {
                debug!(
                    bridge = %self.bridge,
                    tunnel_interface = %interface,
                    sequence,
                    "Missed probe (gap in acknowledgement)"
                );
                self.emit(Event::TunnelProbeReturnFailure {
                    timestamp,
                    interface: interface.clone(),
                    sequence,
                })
                .await;
            }
        }
    }

    async fn emit(&self, event: Event) {
        if self.events.send(event).await.is_err() {
            debug!(bridge = %self.bridge, "Event queue closed, dropping event");
        }
    }

    fn record_error(&self) {
        if let Some(metrics) = &self.metrics {
            metrics.record_error(&self.bridge, scope::PEER_PROBING);
        }
    }

    /// Stamp a foreign probe and echo it back to its sender
    fn respond(&self, transponder: &Arc<Transponder>, from: SocketAddr, mut probe: Probe) {
        probe.respond(self.location, Utc::now());

        let transponder = transponder.clone();
        let bridge = self.bridge.clone();
        tokio::spawn(async move {
            match transponder.send(&probe, from).await {
                Ok(()) | Err(TransponderError::ShuttingDown) => {}
                Err(e) => warn!(
                    bridge = %bridge,
                    tunnel_interface = %transponder.interface(),
                    sequence = probe.sequence,
                    error = %e,
                    "Failed to respond to probe"
                ),
            }
        });
    }

    async fn process_returned(&self, interface: &str, probe: Probe) {
        let now = Utc::now();

        let Some(peer) = self.peers.get(interface) else {
            warn!(bridge = %self.bridge, tunnel_interface = %interface, "Returned probe on unknown interface");
            self.record_error();
            return;
        };

        if probe.dst_uuid != peer.uuid() {
            warn!(
                bridge = %self.bridge,
                tunnel_interface = %interface,
                expected = %peer.uuid(),
                actual = %probe.dst_uuid,
                "Returned probe has destination uuid mismatch"
            );
            self.record_error();
            return;
        }

        if probe.sequence == 0 || probe.sequence > peer.sequence() {
            warn!(
                bridge = %self.bridge,
                tunnel_interface = %interface,
                sequence = probe.sequence,
                sent = peer.sequence(),
                "Returned probe has a sequence that was never sent"
            );
            self.record_error();
            return;
        }

        for sequence in peer.acknowledge(probe.sequence) {
            debug!(
                bridge = %self.bridge,
                tunnel_interface = %interface,
                sequence,
                "Missed probe (later probe came in)"
            );
            self.emit(Event::TunnelProbeReturnFailure {
                timestamp: now,
                interface: interface.to_string(),
                sequence,
            })
            .await;
        }

        self.emit(Event::TunnelProbeReturnSuccess {
            timestamp: now,
            interface: interface.to_string(),
            sequence: probe.sequence,
            latency_forward: probe.latency_forward().unwrap_or_default(),
            latency_return: probe.latency_return(now).unwrap_or_default(),
            location: probe.dst_location,
        })
        .await;
    }
}

#[async_trait]
impl ProbeHandler for Prober {
    async fn handle_probe(&self, transponder: &Arc<Transponder>, from: SocketAddr, probe: Probe) {
        if !probe.is_returned() {
            self.respond(transponder, from, probe);
        } else if probe.src_uuid == self.uuid {
            self.process_returned(transponder.interface(), probe).await;
        } else {
            warn!(
                bridge = %self.bridge,
                tunnel_interface = %transponder.interface(),
                from = %from,
                src_uuid = %probe.src_uuid,
                "Returned probe has source uuid mismatch"
            );
            self.record_error();
        }
    }

    async fn handle_malformed(&self, _transponder: &Arc<Transponder>, _from: SocketAddr, _error: ProbeError) {
        self.record_error();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn prober() -> (Prober, Arc<Transponder>, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(64);
        let mut prober = Prober::new("vpn-1", Location::new("here").unwrap(), tx, None);
        let transponder = Arc::new(Transponder::new("wg0", "127.0.0.1:0".parse().unwrap()));
        prober.add_interface(transponder.clone(), "127.0.0.1:9".parse().unwrap());
        (prober, transponder, rx)
    }

    fn returned(prober: &Prober, sequence: u64) -> Probe {
        let peer = prober.peer("wg0").unwrap();
        let mut probe = Probe::new(sequence, prober.uuid(), Location::default(), peer.uuid());
        probe.respond(Location::new("there").unwrap(), Utc::now());
        probe
    }

    fn drain(rx: &mut mpsc::Receiver<Event>) -> Vec<Event> {
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    fn sequences(events: &[Event]) -> Vec<(&'static str, u64)> {
        events
            .iter()
            .map(|e| match e {
                Event::TunnelProbeReturnFailure { sequence, .. } => ("failure", *sequence),
                Event::TunnelProbeReturnSuccess { sequence, .. } => ("success", *sequence),
                other => panic!("unexpected event {:?}", other),
            })
            .collect()
    }

    #[tokio::test]
    async fn test_returned_probe_reports_gap() {
        let (prober, transponder, mut rx) = prober();
        let from = "127.0.0.1:9".parse().unwrap();
        let peer = prober.peer("wg0").unwrap();
        for _ in 0..5 {
            peer.next_sequence();
        }

        prober.handle_probe(&transponder, from, returned(&prober, 2)).await;
        assert_eq!(sequences(&drain(&mut rx)), vec![("failure", 1), ("success", 2)]);

        prober.handle_probe(&transponder, from, returned(&prober, 5)).await;
        assert_eq!(
            sequences(&drain(&mut rx)),
            vec![("failure", 3), ("failure", 4), ("success", 5)]
        );
        assert_eq!(prober.peer("wg0").unwrap().acknowledgement(), 5);
    }

    #[tokio::test]
    async fn test_returned_probe_carries_location() {
        let (prober, transponder, mut rx) = prober();
        prober.peer("wg0").unwrap().next_sequence();

        prober
            .handle_probe(&transponder, "127.0.0.1:9".parse().unwrap(), returned(&prober, 1))
            .await;

        match drain(&mut rx).as_slice() {
            [Event::TunnelProbeReturnSuccess { location, interface, .. }] => {
                assert_eq!(location.as_str(), "there");
                assert_eq!(interface, "wg0");
            }
            other => panic!("unexpected events {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_foreign_probes_are_dropped() {
        let (prober, transponder, mut rx) = prober();
        let from = "127.0.0.1:9".parse().unwrap();
        prober.peer("wg0").unwrap().next_sequence();

        let mut wrong_dst = returned(&prober, 1);
        wrong_dst.dst_uuid = Uuid::new_v4();
        prober.handle_probe(&transponder, from, wrong_dst).await;

        let mut wrong_src = returned(&prober, 1);
        wrong_src.src_uuid = Uuid::new_v4();
        prober.handle_probe(&transponder, from, wrong_src).await;

        assert!(drain(&mut rx).is_empty());
        assert_eq!(prober.peer("wg0").unwrap().acknowledgement(), 0);
    }

    #[tokio::test]
    async fn test_unsent_sequence_is_dropped() {
        let (tx, mut rx) = mpsc::channel(64);
        let metrics = Arc::new(MetricsRegistry::new(&[1.0]));
        let mut prober = Prober::new("vpn-1", Location::new("here").unwrap(), tx, Some(metrics.clone()));
        let transponder = Arc::new(Transponder::new("wg0", "127.0.0.1:0".parse().unwrap()));
        prober.add_interface(transponder.clone(), "127.0.0.1:9".parse().unwrap());
        let from = "127.0.0.1:9".parse().unwrap();
        let peer = prober.peer("wg0").unwrap();
        for _ in 0..3 {
            peer.next_sequence();
        }

        for sequence in [0, 1_000_000, u64::MAX] {
            prober.handle_probe(&transponder, from, returned(&prober, sequence)).await;
        }
        assert!(drain(&mut rx).is_empty());
        assert_eq!(prober.peer("wg0").unwrap().acknowledgement(), 0);

        let mut buffer = String::new();
        prometheus_client::encoding::text::encode(&mut buffer, &metrics.registry).unwrap();
        assert!(buffer.contains("errors_total{bridge=\"vpn-1\",scope=\"peer_probing\"} 3"));

        // lost probes are still detected afterwards
        for _ in 0..3 {
            peer.next_sequence();
        }
        prober.sweep().await;
        assert_eq!(
            sequences(&drain(&mut rx)),
            vec![("failure", 1), ("failure", 2), ("failure", 3), ("failure", 4), ("failure", 5)]
        );
    }

    #[tokio::test]
    async fn test_sweep_leaves_latest_in_flight() {
        let (prober, _transponder, mut rx) = prober();
        let peer = prober.peer("wg0").unwrap();
        for _ in 0..4 {
            peer.next_sequence();
        }

        prober.sweep().await;
        assert_eq!(
            sequences(&drain(&mut rx)),
            vec![("failure", 1), ("failure", 2), ("failure", 3)]
        );
        assert_eq!(prober.peer("wg0").unwrap().acknowledgement(), 3);

        prober.sweep().await;
        assert!(drain(&mut rx).is_empty());
    }
}
