//! Tunnel HA bridge server
//!
//! Keeps a pair of VPN bridges (one `active`, one `standby`) in agreement on
//! which of them carries traffic, and which of each bridge's tunnel
//! interfaces is in use.
//!
//! # Architecture
//!
//! Every bridge runs a handful of tasks around a single event loop:
//! - **Transponders** exchange UDP probes with the peer over each tunnel
//! - **Ticker** sends probes, sweeps missed ones, polls the partner bridge
//!   and fires reapply timers
//! - **Machine** consumes the events, derives liveness through monitors and
//!   runs the activation elections
//! - **Reconciler** turns (de)activations into scripts run by the executor
//!
//! Status is served to the partner over HTTP; metrics are exported in the
//! Prometheus text format.

pub mod bridge;
pub mod config;
pub mod error;
pub mod event;
pub mod http_server;
pub mod machine;
pub mod metrics;
pub mod partner;
pub mod probing;
pub mod reapply;
pub mod reconciler;
pub mod server;
pub mod state;
pub mod telemetry;
pub mod ticker;
pub mod types;

pub use bridge::Bridge;
pub use config::{Config, ConfigError};
pub use error::{BridgeError, Result};
pub use event::Event;
pub use http_server::{MetricsServer, StatusServer};
pub use machine::Machine;
pub use metrics::MetricsRegistry;
pub use reconciler::{Reconciler, ScriptReconciler};
pub use server::BridgeServer;
pub use state::SharedState;
pub use telemetry::{TelemetryGuard, setup_tracing};
pub use types::{BridgeStatus, Role, ServerConfig};
