//! Prometheus metrics for the bridge server.

use async_trait::async_trait;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::{Family, MetricConstructor};
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::Histogram;
use prometheus_client::registry::Registry;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::RwLock;

/// Error scopes used as the `scope` label of `errors_total`
pub mod scope {
    pub const INTERNAL_LOGIC: &str = "internal_logic";
    pub const PARTNER_POLLING: &str = "partner_polling";
    pub const PEER_PROBING: &str = "peer_probing";
    pub const STATUS_LISTENER: &str = "status_listener";
    pub const SYSTEM: &str = "system";
}

/// Labels for per-bridge metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct BridgeLabels {
    pub bridge: String,
}

/// Labels for per-tunnel-interface metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct TunnelLabels {
    pub bridge: String,
    pub tunnel_interface: String,
}

/// Labels for probe latency metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct LatencyLabels {
    pub bridge: String,
    pub tunnel_interface: String,
    pub probe_location_src: String,
    pub probe_location_dst: String,
}

/// Labels for error metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ErrorLabels {
    pub bridge: String,
    pub scope: String,
}

/// Builds latency histograms with the configured buckets
#[derive(Clone, Debug)]
pub struct LatencyHistogram {
    buckets: Arc<Vec<f64>>,
}

impl MetricConstructor<Histogram> for LatencyHistogram {
    fn new_metric(&self) -> Histogram {
        Histogram::new(self.buckets.iter().copied())
    }
}

/// Exponential latency buckets from 1us up to `max_latency_us`
///
/// Bucket bounds are rounded to half a microsecond; duplicates produced by
/// the rounding at the low end are dropped.
pub fn latency_buckets(count: usize, max_latency_us: u64) -> Vec<f64> {
    if count < 2 {
        return vec![max_latency_us as f64];
    }
    let base = ((max_latency_us as f64).ln() / (count - 1) as f64).exp();
    let mut buckets: Vec<f64> = (0..count)
        .map(|i| (2.0 * base.powi(i as i32)).round() / 2.0)
        .collect();
    buckets.dedup();
    buckets
}

/// Gauge values that are sampled on scrape rather than pushed
#[async_trait]
pub trait MetricsObserver: Send + Sync {
    async fn observe(&self, metrics: &MetricsRegistry);
}

/// Metrics registry with all bridge server metrics
pub struct MetricsRegistry {
    /// Prometheus registry
    pub registry: Registry,

    /// Active bridges, local and partner
    bridge_active: Family<BridgeLabels, Gauge>,
    /// Online bridges, local and partner
    bridge_up: Family<BridgeLabels, Gauge>,
    tunnel_interface_active: Family<TunnelLabels, Gauge>,
    tunnel_interface_up: Family<TunnelLabels, Gauge>,

    probes_sent: Family<TunnelLabels, Counter>,
    probes_returned: Family<TunnelLabels, Counter>,
    probes_failed: Family<TunnelLabels, Counter>,
    probes_latency_forward: Family<LatencyLabels, Histogram, LatencyHistogram>,
    probes_latency_return: Family<LatencyLabels, Histogram, LatencyHistogram>,

    errors: Family<ErrorLabels, Counter>,

    observers: RwLock<Vec<Arc<dyn MetricsObserver>>>,
}

impl MetricsRegistry {
    /// Create a new metrics registry with the given latency buckets (in us)
    pub fn new(latency_buckets: &[f64]) -> Self {
        let mut registry = Registry::default();

        let bridge_active = Family::<BridgeLabels, Gauge>::default();
        registry.register(
            "bridge_active",
            "Number of active bridges at a given moment",
            bridge_active.clone(),
        );

        let bridge_up = Family::<BridgeLabels, Gauge>::default();
        registry.register(
            "bridge_up",
            "Number of online bridges at a given moment",
            bridge_up.clone(),
        );

        let tunnel_interface_active = Family::<TunnelLabels, Gauge>::default();
        registry.register(
            "tunnel_interface_active",
            "Whether the tunnel interface is active (1) or not (0)",
            tunnel_interface_active.clone(),
        );

        let tunnel_interface_up = Family::<TunnelLabels, Gauge>::default();
        registry.register(
            "tunnel_interface_up",
            "Whether the tunnel interface is online (1) or not (0)",
            tunnel_interface_up.clone(),
        );

        let probes_sent = Family::<TunnelLabels, Counter>::default();
        registry.register("probes_sent", "Probes sent", probes_sent.clone());

        let probes_returned = Family::<TunnelLabels, Counter>::default();
        registry.register("probes_returned", "Probes returned", probes_returned.clone());

        let probes_failed = Family::<TunnelLabels, Counter>::default();
        registry.register(
            "probes_failed",
            "Probes that failed to be sent or never returned",
            probes_failed.clone(),
        );

        let constructor = LatencyHistogram {
            buckets: Arc::new(latency_buckets.to_vec()),
        };

        let probes_latency_forward =
            Family::<LatencyLabels, Histogram, LatencyHistogram>::new_with_constructor(
                constructor.clone(),
            );
        registry.register(
            "probes_latency_forward_us",
            "Latency of probes on the way there, in microseconds",
            probes_latency_forward.clone(),
        );

        let probes_latency_return =
            Family::<LatencyLabels, Histogram, LatencyHistogram>::new_with_constructor(constructor);
        registry.register(
            "probes_latency_return_us",
            "Latency of probes on the way back, in microseconds",
            probes_latency_return.clone(),
        );

        let errors = Family::<ErrorLabels, Counter>::default();
        registry.register("errors", "Errors by scope", errors.clone());

        Self {
            registry,
            bridge_active,
            bridge_up,
            tunnel_interface_active,
            tunnel_interface_up,
            probes_sent,
            probes_returned,
            probes_failed,
            probes_latency_forward,
            probes_latency_return,
            errors,
            observers: RwLock::new(Vec::new()),
        }
    }

    /// Register an observer sampled before every scrape
    pub async fn register_observer(&self, observer: Arc<dyn MetricsObserver>) {
        self.observers.write().await.push(observer);
    }

    /// Let every registered observer refresh its gauges
    pub async fn observe(&self) {
        let observers = self.observers.read().await.clone();
        for observer in observers {
            observer.observe(self).await;
        }
    }

    /// Set bridge gauges (counts over the local bridge and its partner)
    pub fn set_bridge(&self, bridge: &str, active: i64, up: i64) {
        let labels = BridgeLabels {
            bridge: bridge.to_string(),
        };
        self.bridge_active.get_or_create(&labels).set(active);
        self.bridge_up.get_or_create(&labels).set(up);
    }

    /// Set tunnel interface gauges
    pub fn set_tunnel_interface(&self, bridge: &str, tunnel_interface: &str, active: bool, up: bool) {
        let labels = tunnel_labels(bridge, tunnel_interface);
        self.tunnel_interface_active
            .get_or_create(&labels)
            .set(active as i64);
        self.tunnel_interface_up.get_or_create(&labels).set(up as i64);
    }

    pub fn record_probe_sent(&self, bridge: &str, tunnel_interface: &str) {
        self.probes_sent
            .get_or_create(&tunnel_labels(bridge, tunnel_interface))
            .inc();
    }

    pub fn record_probe_failed(&self, bridge: &str, tunnel_interface: &str) {
        self.probes_failed
            .get_or_create(&tunnel_labels(bridge, tunnel_interface))
            .inc();
    }

    /// Record a returned probe and its latencies
    pub fn record_probe_returned(
        &self,
        bridge: &str,
        tunnel_interface: &str,
        location_src: &str,
        location_dst: &str,
        latency_forward: Duration,
        latency_return: Duration,
    ) {
        self.probes_returned
            .get_or_create(&tunnel_labels(bridge, tunnel_interface))
            .inc();

        let labels = LatencyLabels {
            bridge: bridge.to_string(),
            tunnel_interface: tunnel_interface.to_string(),
            probe_location_src: location_src.to_string(),
            probe_location_dst: location_dst.to_string(),
        };
        self.probes_latency_forward
            .get_or_create(&labels)
            .observe(latency_forward.as_micros() as f64);
        self.probes_latency_return
            .get_or_create(&labels)
            .observe(latency_return.as_micros() as f64);
    }

    /// Record error by scope
    pub fn record_error(&self, bridge: &str, scope: &str) {
        self.errors
            .get_or_create(&ErrorLabels {
                bridge: bridge.to_string(),
                scope: scope.to_string(),
            })
            .inc();
    }
}

fn tunnel_labels(bridge: &str, tunnel_interface: &str) -> TunnelLabels {
    TunnelLabels {
        bridge: bridge.to_string(),
        tunnel_interface: tunnel_interface.to_string(),
    }
}
