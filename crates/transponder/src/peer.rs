//! Remote endpoint bookkeeping.

use std::net::SocketAddr;
use std::ops::Range;
use std::sync::atomic::{AtomicU64, Ordering};
use uuid::Uuid;

/// Remote probe endpoint reachable over one tunnel interface.
///
/// Tracks the last sequence sent and the acknowledgement watermark: the
/// highest sequence that either returned or was declared missed. Both only
/// ever move forward.
#[derive(Debug)]
pub struct Peer {
    interface: String,
    probe_addr: SocketAddr,
    uuid: Uuid,
    sequence: AtomicU64,
    acknowledgement: AtomicU64,
}

impl Peer {
    /// Create a peer with a fresh random identity
    pub fn new(interface: impl Into<String>, probe_addr: SocketAddr) -> Self {
        Self {
            interface: interface.into(),
            probe_addr,
            uuid: Uuid::new_v4(),
            sequence: AtomicU64::new(0),
            acknowledgement: AtomicU64::new(0),
        }
    }

    /// Tunnel interface the peer is probed over
    pub fn interface(&self) -> &str {
        &self.interface
    }

    /// Where probes are sent to
    pub fn probe_addr(&self) -> SocketAddr {
        self.probe_addr
    }

    /// Identity expected back in returning probes
    pub fn uuid(&self) -> Uuid {
        self.uuid
    }

    /// Allocate the next outbound sequence number (the first one is 1)
    pub fn next_sequence(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Last allocated sequence number
    pub fn sequence(&self) -> u64 {
        self.sequence.load(Ordering::SeqCst)
    }

    /// Current acknowledgement watermark
    pub fn acknowledgement(&self) -> u64 {
        self.acknowledgement.load(Ordering::SeqCst)
    }

    /// Record the return of probe `sequence`.
    ///
    /// Returns the sequences between the previous watermark and `sequence`
    /// that never came back. Late returns below the watermark yield nothing.
    pub fn acknowledge(&self, sequence: u64) -> Range<u64> {
        let previous = self.acknowledgement.fetch_max(sequence, Ordering::SeqCst);
        missed(previous, sequence)
    }

    /// Declare every probe older than the latest one as missed.
    ///
    /// The most recently sent probe is still in flight and is left alone.
    pub fn sweep(&self) -> Range<u64> {
        let sequence = self.sequence();
        let watermark = sequence.saturating_sub(1);
        let previous = self.acknowledgement.fetch_max(watermark, Ordering::SeqCst);
        missed(previous, sequence)
    }
}

fn missed(previous: u64, upto: u64) -> Range<u64> {
    let first = previous.saturating_add(1);
    if upto > first {
        first..upto
    } else {
        0..0
    }
}
