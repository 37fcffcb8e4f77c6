//! Configuration loading and validation for the bridge server

use crate::reapply::ReapplyPolicy;
use crate::types::{Cidr, Role, Script, ServerConfig};
use common::LogFormat;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashSet};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use transponder::Location;
use validator::{Validate, ValidationError, ValidationErrors};

const DEFAULT_PARTNER_STATUS_TIMEOUT: Duration = Duration::from_secs(1);
const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(15);
const DEFAULT_SCRIPTS_TIMEOUT: Duration = Duration::from_secs(30);
const DEFAULT_THRESHOLD_DOWN: usize = 5;
const DEFAULT_THRESHOLD_UP: usize = 2;
const DEFAULT_REAPPLY_FACTOR: f64 = 2.0;

const MIN_PROBE_INTERVAL: Duration = Duration::from_millis(100);
const MIN_REAPPLY_DELAY: Duration = Duration::from_secs(1);

/// Configuration error types
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Configuration file not found in search paths")]
    FileNotFound,

    #[error("Failed to read configuration file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    ParseError(#[from] serde_yaml::Error),

    #[error("Invalid configuration: {0}")]
    ValidationError(#[from] ValidationErrors),
}

/// Main configuration structure
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub bridges: BTreeMap<String, BridgeSettings>,

    #[serde(default)]
    pub metrics: MetricsSettings,

    #[serde(default)]
    pub logging: LoggingSettings,

    #[serde(default)]
    pub telemetry: TelemetrySettings,
}

impl Validate for Config {
    fn validate(&self) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();

        if self.bridges.is_empty() {
            errors.add("bridges", invalid("bridges_empty", "at least one bridge is required".into()));
        }

        let mut status_addrs = HashSet::new();
        for (name, bridge) in &self.bridges {
            if let Err(e) = bridge.validate() {
                errors.add("bridges", invalid("bridge_invalid", format!("{}: {}", name, e)));
            }
            if bridge.probe_location.is_none() {
                if let Err(e) = Location::new(name) {
                    errors.add(
                        "bridges",
                        invalid("bridge_location_invalid", format!("{}: {}", name, e)),
                    );
                }
            }
            if !status_addrs.insert(bridge.status_addr) {
                errors.add(
                    "bridges",
                    invalid(
                        "bridge_status_addr_duplicate",
                        format!("{}: status addr {} is already taken", name, bridge.status_addr),
                    ),
                );
            }
        }

        if let Err(e) = self.metrics.validate() {
            errors.add("metrics", invalid("metrics_invalid", e.to_string()));
        }

        if errors.errors().is_empty() { Ok(()) } else { Err(errors) }
    }
}

/// Settings of one bridge
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BridgeSettings {
    pub role: Role,

    pub bridge_interface: String,

    /// First entry is the primary peer network, the rest are extra
    pub peer_cidrs: Vec<Cidr>,

    pub status_addr: SocketAddr,

    pub partner_url: String,

    /// Interface whose address partner polls originate from
    #[serde(default)]
    pub partner_polling_interface: Option<String>,

    #[serde(default = "default_partner_status_timeout", with = "humantime_serde")]
    pub partner_status_timeout: Duration,

    #[serde(default = "default_threshold_down")]
    pub partner_status_threshold_down: usize,

    #[serde(default = "default_threshold_up")]
    pub partner_status_threshold_up: usize,

    #[serde(default = "default_probe_interval", with = "humantime_serde")]
    pub probe_interval: Duration,

    /// Defaults to the bridge name
    #[serde(default)]
    pub probe_location: Option<Location>,

    pub tunnel_interfaces: BTreeMap<String, TunnelInterfaceSettings>,

    #[serde(default)]
    pub reconcile: ReconcileSettings,
}

impl Validate for BridgeSettings {
    fn validate(&self) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();

        if self.bridge_interface.trim().is_empty() {
            errors.add("bridge_interface", ValidationError::new("bridge_interface_empty"));
        }

        if self.peer_cidrs.is_empty() {
            errors.add("peer_cidrs", ValidationError::new("peer_cidrs_empty"));
        }

        if let Err(e) = validate_partner_url(&self.partner_url) {
            errors.add("partner_url", e);
        }

        if let Err(e) =
            monitor::Monitor::new(self.partner_status_threshold_down, self.partner_status_threshold_up)
        {
            errors.add("partner_status_thresholds", invalid("thresholds_invalid", e.to_string()));
        }

        if let Err(e) = validate_probe_interval(&self.probe_interval) {
            errors.add("probe_interval", e);
        }

        if self.partner_status_timeout.is_zero() || self.partner_status_timeout > self.probe_interval {
            errors.add(
                "partner_status_timeout",
                invalid(
                    "partner_status_timeout_invalid",
                    format!(
                        "expected within (0, {:?}], got {:?}",
                        self.probe_interval, self.partner_status_timeout
                    ),
                ),
            );
        }

        let mut active = 0;
        for (name, ifs) in &self.tunnel_interfaces {
            if let Err(e) = ifs.validate() {
                errors.add(
                    "tunnel_interfaces",
                    invalid("tunnel_interface_invalid", format!("{}: {}", name, e)),
                );
            }
            if ifs.role == Role::Active {
                active += 1;
            }
        }
        if active != 1 {
            errors.add(
                "tunnel_interfaces",
                invalid(
                    "active_tunnel_interfaces_count_invalid",
                    format!("exactly one active tunnel interface is required, got {}", active),
                ),
            );
        }

        if let Err(e) = self.reconcile.validate() {
            errors.add("reconcile", invalid("reconcile_invalid", e.to_string()));
        }

        if errors.errors().is_empty() { Ok(()) } else { Err(errors) }
    }
}

impl BridgeSettings {
    /// Location stamped into probes answered by this bridge
    pub fn location(&self, name: &str) -> Result<Location, transponder::ProbeError> {
        match self.probe_location {
            Some(location) => Ok(location),
            None => Location::new(name),
        }
    }
}

/// Settings of one tunnel interface
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct TunnelInterfaceSettings {
    pub role: Role,

    /// Local address the probe socket binds to
    pub addr: SocketAddr,

    /// Remote address probes are sent to
    pub probe_addr: SocketAddr,

    #[serde(default = "default_threshold_down")]
    #[validate(range(min = 2, max = 10))]
    pub threshold_down: usize,

    #[serde(default = "default_threshold_up")]
    #[validate(range(min = 2, max = 10))]
    pub threshold_up: usize,
}

/// Side effects run on (de)activation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconcileSettings {
    #[serde(default = "default_scripts_timeout", with = "humantime_serde")]
    pub scripts_timeout: Duration,

    #[serde(default)]
    pub bridge_activate: ActivateSettings,

    #[serde(default)]
    pub interface_activate: ActivateSettings,

    #[serde(default)]
    pub interface_deactivate: DeactivateSettings,
}

impl Validate for ReconcileSettings {
    fn validate(&self) -> Result<(), ValidationErrors> {
        let mut errors = ValidationErrors::new();

        if self.scripts_timeout.is_zero() {
            errors.add("scripts_timeout", ValidationError::new("scripts_timeout_zero"));
        }
        if let Err(e) = validate_reapply(&self.bridge_activate.reapply) {
            errors.add("bridge_activate", e);
        }
        if let Err(e) = validate_reapply(&self.interface_activate.reapply) {
            errors.add("interface_activate", e);
        }

        if errors.errors().is_empty() { Ok(()) } else { Err(errors) }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ActivateSettings {
    #[serde(default)]
    pub reapply: ReapplySettings,

    #[serde(default)]
    pub script: Script,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DeactivateSettings {
    #[serde(default)]
    pub script: Script,
}

/// Reapply backoff as written in the file; see [`ReapplySettings::policy`]
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReapplySettings {
    #[serde(default, with = "humantime_serde")]
    pub initial_delay: Option<Duration>,

    #[serde(default, with = "humantime_serde")]
    pub maximum_delay: Option<Duration>,

    #[serde(default)]
    pub factor: Option<f64>,
}

impl ReapplySettings {
    /// Effective policy: a missing delay takes the value of the other one
    pub fn policy(&self) -> ReapplyPolicy {
        let initial_delay = self.initial_delay.or(self.maximum_delay).unwrap_or_default();
        let maximum_delay = self.maximum_delay.or(self.initial_delay).unwrap_or_default();
        ReapplyPolicy {
            initial_delay,
            maximum_delay,
            factor: self.factor.unwrap_or(DEFAULT_REAPPLY_FACTOR),
        }
    }
}

/// Metrics endpoint settings
#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
pub struct MetricsSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_metrics_listen_addr")]
    pub listen_addr: SocketAddr,

    #[serde(default = "default_latency_buckets_count")]
    #[validate(range(min = 2, max = 1000))]
    pub latency_buckets_count: usize,

    #[serde(default = "default_max_latency_us")]
    #[validate(range(min = 2))]
    pub max_latency_us: u64,
}

/// Logging settings
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LoggingSettings {
    pub level: Option<String>,
    pub format: Option<LogFormat>,
}

/// OpenTelemetry export settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TelemetrySettings {
    #[serde(default)]
    pub enabled: bool,

    #[serde(default = "default_service_name")]
    pub service_name: String,

    #[serde(default = "default_otlp_endpoint")]
    pub otlp_endpoint: String,
}

// Default implementations

impl Default for ReconcileSettings {
    fn default() -> Self {
        Self {
            scripts_timeout: DEFAULT_SCRIPTS_TIMEOUT,
            bridge_activate: ActivateSettings::default(),
            interface_activate: ActivateSettings::default(),
            interface_deactivate: DeactivateSettings::default(),
        }
    }
}

impl Default for MetricsSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            listen_addr: default_metrics_listen_addr(),
            latency_buckets_count: default_latency_buckets_count(),
            max_latency_us: default_max_latency_us(),
        }
    }
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            enabled: false,
            service_name: default_service_name(),
            otlp_endpoint: default_otlp_endpoint(),
        }
    }
}

fn default_partner_status_timeout() -> Duration {
    DEFAULT_PARTNER_STATUS_TIMEOUT
}

fn default_probe_interval() -> Duration {
    DEFAULT_PROBE_INTERVAL
}

fn default_scripts_timeout() -> Duration {
    DEFAULT_SCRIPTS_TIMEOUT
}

fn default_threshold_down() -> usize {
    DEFAULT_THRESHOLD_DOWN
}

fn default_threshold_up() -> usize {
    DEFAULT_THRESHOLD_UP
}

fn default_true() -> bool {
    true
}

fn default_metrics_listen_addr() -> SocketAddr {
    SocketAddr::from(([0, 0, 0, 0], 8000))
}

fn default_latency_buckets_count() -> usize {
    33
}

fn default_max_latency_us() -> u64 {
    1_000_000
}

fn default_service_name() -> String {
    "bridge-server".to_string()
}

fn default_otlp_endpoint() -> String {
    "http://localhost:4317".to_string()
}

// Custom validators

fn invalid(code: &'static str, message: String) -> ValidationError {
    let mut error = ValidationError::new(code);
    error.message = Some(message.into());
    error
}

fn validate_partner_url(url: &str) -> Result<(), ValidationError> {
    let parsed = reqwest::Url::parse(url)
        .map_err(|e| invalid("partner_url_invalid", format!("{}: {}", url, e)))?;
    match parsed.scheme() {
        "http" | "https" => Ok(()),
        scheme => Err(invalid(
            "partner_url_scheme_invalid",
            format!("expected http or https, got {}", scheme),
        )),
    }
}

fn validate_probe_interval(interval: &Duration) -> Result<(), ValidationError> {
    if *interval < MIN_PROBE_INTERVAL {
        return Err(ValidationError::new("probe_interval_too_small"));
    }
    Ok(())
}

fn validate_reapply(settings: &ReapplySettings) -> Result<(), ValidationError> {
    let policy = settings.policy();

    if policy.enabled() && policy.initial_delay < MIN_REAPPLY_DELAY {
        return Err(invalid(
            "reapply_initial_delay_invalid",
            format!("expected >= 1s, got {:?}", policy.initial_delay),
        ));
    }
    if policy.maximum_delay < policy.initial_delay {
        return Err(invalid(
            "reapply_maximum_delay_invalid",
            format!(
                "expected >= {:?}, got {:?}",
                policy.initial_delay, policy.maximum_delay
            ),
        ));
    }
    if policy.factor < 1.0 {
        return Err(invalid(
            "reapply_factor_invalid",
            format!("expected >= 1.0, got {}", policy.factor),
        ));
    }
    if policy.factor == 1.0 && policy.initial_delay != policy.maximum_delay {
        return Err(invalid(
            "reapply_factor_invalid",
            "factor 1.0 requires equal initial and maximum delays".to_string(),
        ));
    }
    Ok(())
}

// Configuration loading implementation

impl Config {
    /// Load configuration from `path`, or from the default search paths
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => Self::find_config_file().ok_or(ConfigError::FileNotFound)?,
        };
        tracing::info!("Loading configuration from: {}", path.display());
        Self::load_from_file(&path)
    }

    /// Load configuration from a specific file
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml(&contents)
    }

    /// Parse and validate configuration from YAML text
    pub fn from_yaml(contents: &str) -> Result<Self, ConfigError> {
        let config: Config = serde_yaml::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Find configuration file in standard locations
    fn find_config_file() -> Option<PathBuf> {
        let mut paths = vec![PathBuf::from("/etc/tunnel-ha/bridge-server.yaml")];

        if let Some(home_path) = Self::home_config_path() {
            paths.push(home_path);
        }

        paths.push(PathBuf::from("./bridge-server.yaml"));

        paths.into_iter().find(|p| p.is_file())
    }

    /// Get home directory config path
    fn home_config_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(".config/tunnel-ha/bridge-server.yaml"))
    }

    /// Convert to the internal server configuration
    pub fn to_server_config(&self) -> ServerConfig {
        ServerConfig {
            bridges: self.bridges.clone(),
            metrics_enabled: self.metrics.enabled,
            metrics_listen_addr: self.metrics.listen_addr,
            metrics_latency_buckets: crate::metrics::latency_buckets(
                self.metrics.latency_buckets_count,
                self.metrics.max_latency_us,
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BRIDGE_YAML: &str = r#"
bridges:
  vpn-1:
    role: active
    bridge_interface: eth0
    peer_cidrs: [10.1.0.0/16, 10.2.0.0/16]
    status_addr: 0.0.0.0:8080
    partner_url: http://10.0.0.2:8080
    tunnel_interfaces:
      wg0:
        role: active
        addr: 169.254.0.1:3003
        probe_addr: 169.254.0.2:3003
      wg1:
        role: standby
        addr: 169.254.1.1:3003
        probe_addr: 169.254.1.2:3003
        threshold_down: 3
"#;

    fn with_bridge_line(extra: &str) -> String {
        BRIDGE_YAML.replacen(
            "    bridge_interface: eth0\n",
            &format!("    bridge_interface: eth0\n{}\n", extra),
            1,
        )
    }

    #[test]
    fn test_minimal_yaml_uses_defaults() {
        let config = Config::from_yaml(BRIDGE_YAML).unwrap();
        let bridge = &config.bridges["vpn-1"];

        assert_eq!(bridge.role, Role::Active);
        assert_eq!(bridge.peer_cidrs.len(), 2);
        assert_eq!(bridge.partner_status_timeout, Duration::from_secs(1));
        assert_eq!(bridge.partner_status_threshold_down, 5);
        assert_eq!(bridge.partner_status_threshold_up, 2);
        assert_eq!(bridge.probe_interval, Duration::from_secs(15));
        assert_eq!(bridge.reconcile.scripts_timeout, Duration::from_secs(30));
        assert!(!bridge.reconcile.bridge_activate.reapply.policy().enabled());
        assert_eq!(bridge.tunnel_interfaces["wg0"].threshold_down, 5);
        assert_eq!(bridge.tunnel_interfaces["wg1"].threshold_down, 3);
        assert_eq!(bridge.location("vpn-1").unwrap().as_str(), "vpn-1");

        assert!(config.metrics.enabled);
        assert_eq!(config.metrics.latency_buckets_count, 33);
        assert!(!config.telemetry.enabled);
    }

    #[test]
    fn test_humantime_and_reconcile_parsing() {
        let yaml = with_bridge_line(
            r#"    probe_interval: 500ms
    partner_status_timeout: 250ms
    probe_location: us-east-1a
    reconcile:
      scripts_timeout: 5s
      bridge_activate:
        reapply:
          initial_delay: 1s
          maximum_delay: 8s
        script:
          - [ip, route, replace, "${bridge_peer_cidr}", dev, "${bridge_interface}"]
      interface_deactivate:
        script:
          - [logger, "${tunnel_interface} is down"]"#,
        );

        let config = Config::from_yaml(&yaml).unwrap();
        let bridge = &config.bridges["vpn-1"];
        assert_eq!(bridge.probe_interval, Duration::from_millis(500));
        assert_eq!(bridge.partner_status_timeout, Duration::from_millis(250));
        assert_eq!(bridge.location("vpn-1").unwrap().as_str(), "us-east-1a");

        let policy = bridge.reconcile.bridge_activate.reapply.policy();
        assert!(policy.enabled());
        assert_eq!(policy.initial_delay, Duration::from_secs(1));
        assert_eq!(policy.maximum_delay, Duration::from_secs(8));
        assert_eq!(policy.factor, 2.0);

        assert_eq!(bridge.reconcile.bridge_activate.script[0][0], "ip");
        assert_eq!(bridge.reconcile.interface_deactivate.script.len(), 1);
        assert!(bridge.reconcile.interface_activate.script.is_empty());
    }

    #[test]
    fn test_reapply_missing_delay_is_mirrored() {
        let settings = ReapplySettings {
            initial_delay: None,
            maximum_delay: Some(Duration::from_secs(4)),
            factor: None,
        };
        let policy = settings.policy();
        assert_eq!(policy.initial_delay, Duration::from_secs(4));
        assert_eq!(policy.maximum_delay, Duration::from_secs(4));
        assert!(validate_reapply(&settings).is_ok());
    }

    #[test]
    fn test_reapply_validation() {
        let reapply = |initial: u64, maximum: u64, factor: f64| ReapplySettings {
            initial_delay: Some(Duration::from_millis(initial)),
            maximum_delay: Some(Duration::from_millis(maximum)),
            factor: Some(factor),
        };

        assert!(validate_reapply(&ReapplySettings::default()).is_ok());
        assert!(validate_reapply(&reapply(1000, 8000, 2.0)).is_ok());
        assert!(validate_reapply(&reapply(5000, 5000, 1.0)).is_ok());

        assert!(validate_reapply(&reapply(500, 8000, 2.0)).is_err());
        assert!(validate_reapply(&reapply(4000, 2000, 2.0)).is_err());
        assert!(validate_reapply(&reapply(1000, 8000, 0.5)).is_err());
        assert!(validate_reapply(&reapply(1000, 8000, 1.0)).is_err());
    }

    #[test]
    fn test_exactly_one_active_interface() {
        let yaml = BRIDGE_YAML.replace("role: standby\n        addr: 169.254.1.1", "role: active\n        addr: 169.254.1.1");
        assert!(matches!(
            Config::from_yaml(&yaml),
            Err(ConfigError::ValidationError(_))
        ));

        let yaml = BRIDGE_YAML.replace("        role: active\n        addr: 169.254.0.1", "        role: standby\n        addr: 169.254.0.1");
        assert!(Config::from_yaml(&yaml).is_err());
    }

    #[test]
    fn test_invalid_thresholds() {
        let yaml = with_bridge_line("    partner_status_threshold_down: 11");
        assert!(Config::from_yaml(&yaml).is_err());

        let yaml = BRIDGE_YAML.replace("threshold_down: 3", "threshold_down: 1");
        assert!(Config::from_yaml(&yaml).is_err());
    }

    #[test]
    fn test_invalid_partner_url() {
        let yaml = BRIDGE_YAML.replace("http://10.0.0.2:8080", "not a url");
        assert!(Config::from_yaml(&yaml).is_err());

        let yaml = BRIDGE_YAML.replace("http://10.0.0.2:8080", "ftp://10.0.0.2");
        assert!(Config::from_yaml(&yaml).is_err());
    }

    #[test]
    fn test_invalid_probe_interval() {
        let yaml = with_bridge_line("    probe_interval: 10ms\n    partner_status_timeout: 5ms");
        assert!(Config::from_yaml(&yaml).is_err());

        // partner polling must fit into one tick
        let yaml = with_bridge_line("    probe_interval: 1s\n    partner_status_timeout: 2s");
        assert!(Config::from_yaml(&yaml).is_err());
    }

    #[test]
    fn test_invalid_peer_cidr_fails_parsing() {
        let yaml = BRIDGE_YAML.replace("10.2.0.0/16", "10.2.0.0/40");
        assert!(matches!(
            Config::from_yaml(&yaml),
            Err(ConfigError::ParseError(_))
        ));
    }

    #[test]
    fn test_location_too_long() {
        let yaml = with_bridge_line(&format!("    probe_location: {}", "x".repeat(37)));
        assert!(matches!(
            Config::from_yaml(&yaml),
            Err(ConfigError::ParseError(_))
        ));
    }

    #[test]
    fn test_no_bridges() {
        assert!(Config::from_yaml("bridges: {}").is_err());
        assert!(Config::from_yaml("metrics: {enabled: false}").is_err());
    }

    #[test]
    fn test_duplicate_status_addr() {
        let second = BRIDGE_YAML
            .replace("bridges:\n", "")
            .replace("vpn-1:", "vpn-2:")
            .replace("role: active\n    bridge_interface", "role: standby\n    bridge_interface");
        let yaml = format!("{}{}", BRIDGE_YAML, second);
        assert!(Config::from_yaml(&yaml).is_err());

        let yaml = format!(
            "{}{}",
            BRIDGE_YAML,
            second.replace("0.0.0.0:8080", "0.0.0.0:8081")
        );
        let config = Config::from_yaml(&yaml).unwrap();
        assert_eq!(config.bridges.len(), 2);
        assert_eq!(config.bridges["vpn-2"].role, Role::Standby);
    }

    #[test]
    fn test_config_to_server_config_conversion() {
        let config = Config::from_yaml(BRIDGE_YAML).unwrap();
        let server_config = config.to_server_config();

        assert_eq!(server_config.bridges.len(), 1);
        assert!(server_config.metrics_enabled);
        assert_eq!(server_config.metrics_listen_addr.port(), 8000);
        assert!(!server_config.metrics_latency_buckets.is_empty());
    }
}
