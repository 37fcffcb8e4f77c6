//! Probe wire format and parsing.
//!
//! All fields are in network byte order, 128 bytes in total:
//!
//! ```text
//! +----------+----------+--------------+--------------+----------+--------------+--------------+
//! | Sequence | Src UUID | Src Location | Src Time     | Dst UUID | Dst Location | Dst Time     |
//! |   (8)    |   (16)   |     (36)     |   (8)        |   (16)   |     (36)     |   (8)        |
//! +----------+----------+--------------+--------------+----------+--------------+--------------+
//! ```
//!
//! Timestamps are signed nanoseconds since the Unix epoch. A zero destination
//! timestamp marks a probe that has not been answered yet.

use crate::types::{LOCATION_SIZE, Location, PROBE_SIZE, ProbeError};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use chrono::{DateTime, Utc};
use std::time::Duration;
use uuid::Uuid;

/// Heartbeat message exchanged between bridges over a tunnel interface.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Probe {
    /// Sender's sequence number
    pub sequence: u64,

    /// Identity of the sending bridge
    pub src_uuid: Uuid,

    /// Where the probe was sent from
    pub src_location: Location,

    /// When the probe was sent
    pub src_timestamp: DateTime<Utc>,

    /// Identity of the peer the probe is addressed to
    pub dst_uuid: Uuid,

    /// Where the probe was answered
    pub dst_location: Location,

    /// When the probe was answered; `None` until it makes a round trip
    pub dst_timestamp: Option<DateTime<Utc>>,
}

impl Probe {
    /// Create a new outgoing probe stamped with the current time
    pub fn new(sequence: u64, src_uuid: Uuid, src_location: Location, dst_uuid: Uuid) -> Self {
        Self {
            sequence,
            src_uuid,
            src_location,
            src_timestamp: Utc::now(),
            dst_uuid,
            dst_location: Location::default(),
            dst_timestamp: None,
        }
    }

    /// Whether this probe has already been answered by the remote side
    pub fn is_returned(&self) -> bool {
        self.dst_timestamp.is_some()
    }

    /// Stamp the probe as answered here, at `now`
    pub fn respond(&mut self, location: Location, now: DateTime<Utc>) {
        self.dst_location = location;
        self.dst_timestamp = Some(now);
    }

    /// Time the probe took to reach the remote side
    ///
    /// Clock skew between the two hosts can make this negative; it is then
    /// clamped to zero.
    pub fn latency_forward(&self) -> Option<Duration> {
        self.dst_timestamp
            .map(|dst| (dst - self.src_timestamp).to_std().unwrap_or_default())
    }

    /// Time the answer took to come back, as observed at `now`
    pub fn latency_return(&self, now: DateTime<Utc>) -> Option<Duration> {
        self.dst_timestamp
            .map(|dst| (now - dst).to_std().unwrap_or_default())
    }

    /// Parse a probe from raw bytes
    pub fn parse(data: &[u8]) -> Result<Self, ProbeError> {
        if data.len() != PROBE_SIZE {
            return Err(ProbeError::InvalidLength {
                expected: PROBE_SIZE,
                actual: data.len(),
            });
        }

        let mut buf = data;

        let sequence = buf.get_u64();
        let src_uuid = read_uuid(&mut buf);
        let src_location = read_location(&mut buf)?;
        let src_timestamp = DateTime::from_timestamp_nanos(buf.get_i64());
        let dst_uuid = read_uuid(&mut buf);
        let dst_location = read_location(&mut buf)?;
        let dst_timestamp = match buf.get_i64() {
            0 => None,
            nanos => Some(DateTime::from_timestamp_nanos(nanos)),
        };

        Ok(Self {
            sequence,
            src_uuid,
            src_location,
            src_timestamp,
            dst_uuid,
            dst_location,
            dst_timestamp,
        })
    }

    /// Serialize probe to bytes
    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(PROBE_SIZE);

        buf.put_u64(self.sequence);
        buf.put_slice(self.src_uuid.as_bytes());
        buf.put_slice(self.src_location.as_bytes());
        buf.put_i64(encode_timestamp(Some(self.src_timestamp)));
        buf.put_slice(self.dst_uuid.as_bytes());
        buf.put_slice(self.dst_location.as_bytes());
        buf.put_i64(encode_timestamp(self.dst_timestamp));

        buf.freeze()
    }
}

fn encode_timestamp(timestamp: Option<DateTime<Utc>>) -> i64 {
    timestamp
        .and_then(|ts| ts.timestamp_nanos_opt())
        .unwrap_or_default()
}

fn read_uuid(buf: &mut &[u8]) -> Uuid {
    let mut bytes = [0u8; 16];
    buf.copy_to_slice(&mut bytes);
    Uuid::from_bytes(bytes)
}

fn read_location(buf: &mut &[u8]) -> Result<Location, ProbeError> {
    let mut bytes = [0u8; LOCATION_SIZE];
    buf.copy_to_slice(&mut bytes);
    Location::from_bytes(bytes)
}
