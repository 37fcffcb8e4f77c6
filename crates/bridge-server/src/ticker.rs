//! Periodic driver of a bridge.

use crate::event::Event;
use crate::partner::PartnerPoller;
use crate::probing::Prober;
use crate::state::SharedState;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

/// Fires once per probe interval: probes, sweeps missed probes, polls the
/// partner and fires due reapply timers, in that order.
pub struct Ticker {
    bridge: String,
    interval: Duration,
    prober: Arc<Prober>,
    poller: PartnerPoller,
    state: Arc<SharedState>,
    events: mpsc::Sender<Event>,
}

impl Ticker {
    pub fn new(
        bridge: &str,
        interval: Duration,
        prober: Arc<Prober>,
        poller: PartnerPoller,
        state: Arc<SharedState>,
        events: mpsc::Sender<Event>,
    ) -> Self {
        Self {
            bridge: bridge.to_string(),
            interval,
            prober,
            poller,
            state,
            events,
        }
    }

    pub async fn run(self, cancel: CancellationToken) {
        info!(bridge = %self.bridge, interval = ?self.interval, "Ticker started");

        let mut interval = tokio::time::interval(self.interval);
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {}
            }
            // a tick is never interrupted half way
            self.tick().await;
        }

        info!(bridge = %self.bridge, "Ticker stopped");
    }

    /// Run one round
    pub async fn tick(&self) {
        self.prober.send_probes();
        self.prober.sweep().await;

        let event = self.poller.poll().await;
        self.emit(event).await;

        for event in self.due_reapplies(Utc::now()).await {
            self.emit(event).await;
        }
    }

    /// Reactivation events of the timers due at `now`
    async fn due_reapplies(&self, now: DateTime<Utc>) -> Vec<Event> {
        let (bridge_active, active_interface) = {
            let status = self.state.status.read().await;
            (status.active, status.active_interface().map(str::to_string))
        };

        let mut due = Vec::new();
        let mut reapply = self.state.reapply.lock().await;

        if let Some(iteration) = reapply.bridge.as_mut().and_then(|r| r.take_due(now)) {
            if bridge_active {
                due.push(Event::BridgeReactivated {
                    timestamp: now,
                    iteration,
                });
            }
        }

        if let Some(iteration) = reapply.interface.as_mut().and_then(|r| r.take_due(now)) {
            if let Some(interface) = active_interface {
                due.push(Event::TunnelInterfaceReactivated {
                    timestamp: now,
                    interface,
                    iteration,
                });
            }
        }

        due
    }

    async fn emit(&self, event: Event) {
        if self.events.send(event).await.is_err() {
            debug!(bridge = %self.bridge, "Event queue closed, dropping event");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reapply::{ReapplyPolicy, ReapplyState};
    use crate::types::{BridgeStatus, Role};
    use chrono::TimeDelta;
    use transponder::Location;

    fn ticker(state: Arc<SharedState>) -> (Ticker, mpsc::Receiver<Event>) {
        let (tx, rx) = mpsc::channel(16);
        let prober = Arc::new(Prober::new("vpn-1", Location::default(), tx.clone(), None));
        let poller =
            PartnerPoller::new("http://127.0.0.1:9", Duration::from_millis(100), None).unwrap();
        let ticker = Ticker::new("vpn-1", Duration::from_secs(1), prober, poller, state, tx);
        (ticker, rx)
    }

    fn state() -> Arc<SharedState> {
        let policy = ReapplyPolicy {
            initial_delay: Duration::from_secs(1),
            maximum_delay: Duration::from_secs(8),
            factor: 2.0,
        };
        Arc::new(SharedState::new(
            BridgeStatus::new("vpn-1", Role::Active, ["wg0", "wg1"], Utc::now()),
            ReapplyState::new(policy, policy),
        ))
    }

    #[tokio::test]
    async fn test_due_reapplies_for_active_subjects() {
        let state = state();
        let now = Utc::now();
        {
            let mut status = state.status.write().await;
            status.active = true;
            status.interfaces.get_mut("wg1").unwrap().active = true;
        }
        {
            let mut reapply = state.reapply.lock().await;
            reapply.bridge.as_mut().unwrap().arm(now);
            reapply.interface.as_mut().unwrap().arm(now);
        }
        let (ticker, _rx) = ticker(state.clone());

        assert!(ticker.due_reapplies(now).await.is_empty());

        let later = now + TimeDelta::seconds(1);
        let due = ticker.due_reapplies(later).await;
        assert_eq!(
            due,
            vec![
                Event::BridgeReactivated {
                    timestamp: later,
                    iteration: 0
                },
                Event::TunnelInterfaceReactivated {
                    timestamp: later,
                    interface: "wg1".to_string(),
                    iteration: 0
                },
            ]
        );

        // timers stay disarmed until the machine advances them
        assert!(ticker.due_reapplies(later + TimeDelta::seconds(60)).await.is_empty());
    }

    #[tokio::test]
    async fn test_due_reapply_skipped_when_inactive() {
        let state = state();
        let now = Utc::now();
        state.reapply.lock().await.bridge.as_mut().unwrap().arm(now);
        let (ticker, _rx) = ticker(state.clone());

        assert!(ticker.due_reapplies(now + TimeDelta::seconds(5)).await.is_empty());
        assert!(state.reapply.lock().await.bridge.as_ref().unwrap().next().is_none());
    }

    #[tokio::test]
    async fn test_tick_polls_partner() {
        let (ticker, mut rx) = ticker(state());

        ticker.tick().await;

        match rx.recv().await {
            Some(Event::PartnerPollFailure { sequence, .. }) => assert_eq!(sequence, 1),
            other => panic!("unexpected event {:?}", other),
        }
    }
}
