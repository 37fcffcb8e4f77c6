//! Sequence-numbered UDP heartbeat protocol between bridge pairs.
//!
//! Each tunnel interface gets a [`Transponder`] bound to its local probe
//! address and a [`Peer`] describing the remote end. Probes travel to the
//! peer, get stamped there and come back, which yields per-tunnel liveness
//! and forward/return latency.
//!
//! # Example
//!
//! ```no_run
//! use std::sync::Arc;
//! use transponder::{Location, Peer, Probe, Transponder};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let transponder = Arc::new(Transponder::new("wg0", "10.0.0.1:3003".parse()?));
//! transponder.connect().await?;
//!
//! let peer = Peer::new("wg0", "10.0.0.2:3003".parse()?);
//! let bridge_uuid = uuid::Uuid::new_v4();
//! let probe = Probe::new(peer.next_sequence(), bridge_uuid, Location::new("dc-1")?, peer.uuid());
//! transponder.send(&probe, peer.probe_addr()).await?;
//! # Ok(())
//! # }
//! ```

pub mod peer;
pub mod probe;
pub mod transponder;
pub mod types;

pub use peer::Peer;
pub use probe::Probe;
pub use transponder::{ProbeHandler, Transponder};
pub use types::{LOCATION_SIZE, Location, PROBE_SIZE, ProbeError, TransponderError};
