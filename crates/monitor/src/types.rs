//! Liveness classification types.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Smallest accepted up/down threshold.
pub const MIN_THRESHOLD: usize = 2;

/// Largest accepted up/down threshold.
pub const MAX_THRESHOLD: usize = 10;

/// Debounced liveness of a monitored subject.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
#[repr(i8)]
pub enum Status {
    /// Enough consecutive failures were observed
    Down = -1,
    /// Not known yet
    #[default]
    Pending = 0,
    /// Enough consecutive successes were observed
    Up = 1,
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Status::Down => write!(f, "DOWN"),
            Status::Pending => write!(f, "PENDING"),
            Status::Up => write!(f, "UP"),
        }
    }
}

/// Monitor construction errors.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum Error {
    #[error("down threshold is invalid: {0} (must be within [2, 10])")]
    DownThresholdInvalid(usize),

    #[error("up threshold is invalid: {0} (must be within [2, 10])")]
    UpThresholdInvalid(usize),
}
