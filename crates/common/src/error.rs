//! Common error types for the tunnel HA components.

use std::fmt;

/// A specialized Result type for bridge operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for bridge operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Partner error: {0}")]
    Partner(String),

    #[error("Reconcile error: {0}")]
    Reconcile(String),
}

impl Error {
    /// Create a new partner error.
    pub fn partner(msg: impl fmt::Display) -> Self {
        Error::Partner(msg.to_string())
    }

    /// Create a new reconcile error.
    pub fn reconcile(msg: impl fmt::Display) -> Self {
        Error::Reconcile(msg.to_string())
    }
}
