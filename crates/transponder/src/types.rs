//! Probe protocol data types.

use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::str::FromStr;

/// Size of a location field on the wire
pub const LOCATION_SIZE: usize = 36;

/// Size of an encoded probe
pub const PROBE_SIZE: usize = 8 + 16 + LOCATION_SIZE + 8 + 16 + LOCATION_SIZE + 8;

/// Probe codec errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProbeError {
    #[error("invalid probe length: expected {expected} bytes, got {actual}")]
    InvalidLength { expected: usize, actual: usize },

    #[error("location is too long: {0} bytes (max 36)")]
    LocationTooLong(usize),

    #[error("location is not valid utf-8")]
    LocationNotUtf8,
}

/// Transponder socket errors
#[derive(Debug, thiserror::Error)]
pub enum TransponderError {
    #[error("failed to bind probe socket to {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("transponder is not connected")]
    NotConnected,

    #[error("transponder is shutting down")]
    ShuttingDown,

    #[error("probe socket error: {0}")]
    Io(#[from] io::Error),
}

/// Free-form label of where a probe was stamped (zero padded on the wire).
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Location([u8; LOCATION_SIZE]);

impl Default for Location {
    fn default() -> Self {
        Self([0u8; LOCATION_SIZE])
    }
}

impl Location {
    /// Create a location from a string of at most 36 bytes.
    pub fn new(location: &str) -> Result<Self, ProbeError> {
        let raw = location.as_bytes();
        if raw.len() > LOCATION_SIZE {
            return Err(ProbeError::LocationTooLong(raw.len()));
        }

        let mut bytes = [0u8; LOCATION_SIZE];
        bytes[..raw.len()].copy_from_slice(raw);
        Ok(Self(bytes))
    }

    /// Decode a location from its wire representation.
    pub fn from_bytes(bytes: [u8; LOCATION_SIZE]) -> Result<Self, ProbeError> {
        let end = Self::trimmed_len(&bytes);
        std::str::from_utf8(&bytes[..end]).map_err(|_| ProbeError::LocationNotUtf8)?;
        Ok(Self(bytes))
    }

    /// Wire representation.
    pub fn as_bytes(&self) -> &[u8; LOCATION_SIZE] {
        &self.0
    }

    /// Location without the zero padding.
    pub fn as_str(&self) -> &str {
        let end = Self::trimmed_len(&self.0);
        std::str::from_utf8(&self.0[..end]).unwrap_or_default()
    }

    /// Whether the location carries no label.
    pub fn is_empty(&self) -> bool {
        self.0[0] == 0
    }

    fn trimmed_len(bytes: &[u8; LOCATION_SIZE]) -> usize {
        bytes.iter().rposition(|b| *b != 0).map_or(0, |pos| pos + 1)
    }
}

impl fmt::Display for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl fmt::Debug for Location {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Location({:?})", self.as_str())
    }
}

impl FromStr for Location {
    type Err = ProbeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl Serialize for Location {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for Location {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        Self::new(&raw).map_err(serde::de::Error::custom)
    }
}
