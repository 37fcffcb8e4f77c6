//! Bridge server error types

use crate::config::ConfigError;
use crate::types::Role;
use thiserror::Error;

/// Errors raised while building or running a bridge.
///
/// Anything delivered on the failure sink is fatal: the server stops every
/// bridge and exits.
#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("partner's bridge name is different from ours: {ours} != {partner}")]
    PartnerNameMismatch { ours: String, partner: String },

    #[error("partner's bridge role is the same as ours: {0}")]
    PartnerRoleIdentical(Role),

    #[error("partner's bridge changed its name: {from} -> {to}")]
    PartnerChangedName { from: String, to: String },

    #[error("invalid monitor thresholds for {subject}: {source}")]
    Monitor {
        subject: String,
        #[source]
        source: monitor::Error,
    },

    #[error("invalid bridge settings: {0}")]
    InvalidSettings(String),

    #[error("transponder error: {0}")]
    Transponder(#[from] transponder::TransponderError),

    #[error("failed to start status server on {addr}: {source}")]
    StatusServer {
        addr: std::net::SocketAddr,
        #[source]
        source: std::io::Error,
    },

    #[error("configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Common(#[from] common::Error),
}

/// Result alias for bridge operations
pub type Result<T> = std::result::Result<T, BridgeError>;

impl BridgeError {
    /// Whether the error was caused by the partner's reported state
    pub fn is_partner_fault(&self) -> bool {
        matches!(
            self,
            BridgeError::PartnerNameMismatch { .. }
                | BridgeError::PartnerRoleIdentical(_)
                | BridgeError::PartnerChangedName { .. }
        )
    }
}
