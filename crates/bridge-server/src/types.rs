//! Bridge server types and structures.

use crate::config::BridgeSettings;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::collections::BTreeMap;
use std::fmt;
use std::net::{IpAddr, SocketAddr};
use std::str::FromStr;

/// Configured bias of a bridge or tunnel interface in the election
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    /// Claims activation whenever it is up
    Active,
    /// Only takes over when nothing else is active
    Standby,
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Role::Active => write!(f, "active"),
            Role::Standby => write!(f, "standby"),
        }
    }
}

/// IP network in CIDR notation (e.g., `10.0.0.0/16`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Cidr {
    addr: IpAddr,
    prefix: u8,
}

impl Cidr {
    /// Create a new CIDR block
    pub fn new(addr: IpAddr, prefix: u8) -> Result<Self, String> {
        let max = if addr.is_ipv4() { 32 } else { 128 };
        if prefix > max {
            return Err(format!("prefix length {} exceeds {} for {}", prefix, max, addr));
        }
        Ok(Self { addr, prefix })
    }

    /// Network address
    pub fn addr(&self) -> IpAddr {
        self.addr
    }

    /// Prefix length
    pub fn prefix(&self) -> u8 {
        self.prefix
    }

    /// Whether this is an IPv4 block
    pub fn is_ipv4(&self) -> bool {
        self.addr.is_ipv4()
    }
}

impl fmt::Display for Cidr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{}", self.addr, self.prefix)
    }
}

impl FromStr for Cidr {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (addr, prefix) = s
            .split_once('/')
            .ok_or_else(|| format!("invalid cidr (missing prefix length): {}", s))?;
        let addr = addr
            .parse::<IpAddr>()
            .map_err(|e| format!("invalid cidr address {}: {}", addr, e))?;
        let prefix = prefix
            .parse::<u8>()
            .map_err(|e| format!("invalid cidr prefix length {}: {}", prefix, e))?;
        Self::new(addr, prefix)
    }
}

impl Serialize for Cidr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

impl<'de> Deserialize<'de> for Cidr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        raw.parse().map_err(serde::de::Error::custom)
    }
}

/// Sequence of commands, each one a program followed by its arguments
pub type Script = Vec<Vec<String>>;

/// Externally visible state of one tunnel interface
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TunnelInterfaceStatus {
    pub active: bool,
    pub active_since: DateTime<Utc>,
    pub up: bool,
    pub up_since: DateTime<Utc>,
}

impl TunnelInterfaceStatus {
    /// Inactive and down since `now`
    pub fn new(now: DateTime<Utc>) -> Self {
        Self {
            active: false,
            active_since: now,
            up: false,
            up_since: now,
        }
    }
}

/// Externally visible state of a bridge, exchanged with the partner
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BridgeStatus {
    pub name: String,
    pub role: Role,
    pub active: bool,
    pub active_since: DateTime<Utc>,
    pub up: bool,
    pub up_since: DateTime<Utc>,
    pub interfaces: BTreeMap<String, TunnelInterfaceStatus>,
}

impl BridgeStatus {
    /// Initial status: nothing is up or active yet
    pub fn new<'a>(
        name: impl Into<String>,
        role: Role,
        interfaces: impl IntoIterator<Item = &'a str>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            name: name.into(),
            role,
            active: false,
            active_since: now,
            up: false,
            up_since: now,
            interfaces: interfaces
                .into_iter()
                .map(|name| (name.to_string(), TunnelInterfaceStatus::new(now)))
                .collect(),
        }
    }

    /// Name of the currently active tunnel interface, if any
    pub fn active_interface(&self) -> Option<&str> {
        self.interfaces
            .iter()
            .find(|(_, ifs)| ifs.active)
            .map(|(name, _)| name.as_str())
    }
}

/// Internal server configuration
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Bridges to run, by name
    pub bridges: BTreeMap<String, BridgeSettings>,

    /// Whether the metrics endpoint is enabled
    pub metrics_enabled: bool,

    /// Metrics listen address
    pub metrics_listen_addr: SocketAddr,

    /// Latency histogram buckets, in microseconds
    pub metrics_latency_buckets: Vec<f64>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cidr_parsing() {
        let cidr: Cidr = "10.1.0.0/16".parse().unwrap();
        assert_eq!(cidr.addr(), "10.1.0.0".parse::<IpAddr>().unwrap());
        assert_eq!(cidr.prefix(), 16);
        assert!(cidr.is_ipv4());
        assert_eq!(cidr.to_string(), "10.1.0.0/16");

        let cidr: Cidr = "fd00::/64".parse().unwrap();
        assert!(!cidr.is_ipv4());

        assert!("10.1.0.0".parse::<Cidr>().is_err());
        assert!("10.1.0.0/33".parse::<Cidr>().is_err());
        assert!("fd00::/129".parse::<Cidr>().is_err());
        assert!("bridge/8".parse::<Cidr>().is_err());
    }

    #[test]
    fn test_role_serde() {
        assert_eq!(serde_json::to_string(&Role::Standby).unwrap(), "\"standby\"");
        let role: Role = serde_json::from_str("\"active\"").unwrap();
        assert_eq!(role, Role::Active);
        assert!(serde_json::from_str::<Role>("\"primary\"").is_err());
    }

    #[test]
    fn test_bridge_status_json() {
        let now = DateTime::from_timestamp(1_700_000_000, 0).unwrap();
        let mut status = BridgeStatus::new("vpn-1", Role::Active, ["wg0", "wg1"], now);
        status.interfaces.get_mut("wg1").unwrap().active = true;

        let json: serde_json::Value = serde_json::to_value(&status).unwrap();
        assert_eq!(json["name"], "vpn-1");
        assert_eq!(json["role"], "active");
        assert_eq!(json["active"], false);
        assert_eq!(json["interfaces"]["wg1"]["active"], true);
        assert_eq!(json["interfaces"]["wg0"]["up"], false);

        let decoded: BridgeStatus = serde_json::from_value(json).unwrap();
        assert_eq!(decoded, status);
        assert_eq!(decoded.active_interface(), Some("wg1"));
    }
}
