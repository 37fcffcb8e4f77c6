//! Side effects of bridge and tunnel interface (de)activation.
//!
//! The state machine only ever talks to a [`Reconciler`]. The script
//! reconciler renders the configured scripts and hands them to an
//! [`Executor`] that runs them one at a time, in order, off the event loop.

use crate::config::BridgeSettings;
use crate::metrics::{MetricsRegistry, scope};
use crate::types::{Cidr, Script};
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

const PLACEHOLDER_PROTO: &str = "proto";
const PLACEHOLDER_BRIDGE_INTERFACE: &str = "bridge_interface";
const PLACEHOLDER_BRIDGE_INTERFACE_IP: &str = "bridge_interface_ip";
const PLACEHOLDER_BRIDGE_PEER_CIDR: &str = "bridge_peer_cidr";
const PLACEHOLDER_BRIDGE_EXTRA_PEER_CIDRS: &str = "bridge_extra_peer_cidrs";
const PLACEHOLDER_TUNNEL_INTERFACE: &str = "tunnel_interface";
const PLACEHOLDER_TUNNEL_INTERFACE_IP: &str = "tunnel_interface_ip";

/// Bridge (re-)activation request
#[derive(Debug, Clone, PartialEq)]
pub struct BridgeActivation {
    pub bridge_interface: String,
    pub peer_cidrs: Vec<Cidr>,
    /// 0 for the initial activation, then one per re-application
    pub iteration: u32,
}

/// Tunnel interface (de)activation request
#[derive(Debug, Clone, PartialEq)]
pub struct InterfaceActivation {
    pub bridge_interface: String,
    pub peer_cidrs: Vec<Cidr>,
    pub tunnel_interface: String,
    pub iteration: u32,
}

/// Applies the outcome of the election to the host.
///
/// Calls come from the event loop and must not block.
pub trait Reconciler: Send + Sync {
    fn bridge_activate(&self, request: &BridgeActivation);

    fn interface_activate(&self, request: &InterfaceActivation);

    fn interface_deactivate(&self, request: &InterfaceActivation);
}

/// Rendered script waiting for execution
#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub name: &'static str,
    pub script: Script,
}

type InterfaceLookup = dyn Fn(&str, bool) -> common::Result<IpAddr> + Send + Sync;

/// Reconciler running user supplied scripts
pub struct ScriptReconciler {
    bridge: String,
    bridge_activate: Script,
    interface_activate: Script,
    interface_deactivate: Script,
    jobs: mpsc::UnboundedSender<Job>,
    lookup: Box<InterfaceLookup>,
    metrics: Option<Arc<MetricsRegistry>>,
}

impl ScriptReconciler {
    /// Create the reconciler of bridge `name` along with its executor
    pub fn new(
        name: &str,
        settings: &BridgeSettings,
        metrics: Option<Arc<MetricsRegistry>>,
    ) -> (Self, Executor) {
        let (tx, rx) = mpsc::unbounded_channel();
        let reconcile = &settings.reconcile;

        let reconciler = Self {
            bridge: name.to_string(),
            bridge_activate: reconcile.bridge_activate.script.clone(),
            interface_activate: reconcile.interface_activate.script.clone(),
            interface_deactivate: reconcile.interface_deactivate.script.clone(),
            jobs: tx,
            lookup: Box::new(interface_ip),
            metrics: metrics.clone(),
        };
        let executor = Executor {
            bridge: name.to_string(),
            timeout: reconcile.scripts_timeout,
            jobs: rx,
            metrics,
        };
        (reconciler, executor)
    }

    /// Replace the interface address lookup
    pub fn with_lookup(
        mut self,
        lookup: impl Fn(&str, bool) -> common::Result<IpAddr> + Send + Sync + 'static,
    ) -> Self {
        self.lookup = Box::new(lookup);
        self
    }

    fn schedule(
        &self,
        name: &'static str,
        source: &Script,
        bridge_interface: &str,
        peer_cidrs: &[Cidr],
        tunnel_interface: Option<&str>,
    ) {
        if source.is_empty() {
            debug!(bridge = %self.bridge, script = name, "No script configured, skipping");
            return;
        }

        let params = match self.placeholders(bridge_interface, peer_cidrs, tunnel_interface) {
            Ok(params) => params,
            Err(e) => {
                error!(
                    bridge = %self.bridge,
                    script = name,
                    error = %e,
                    "Failed to render script placeholders"
                );
                if let Some(metrics) = &self.metrics {
                    metrics.record_error(&self.bridge, scope::SYSTEM);
                }
                return;
            }
        };

        let job = Job {
            name,
            script: render(source, &params),
        };
        if self.jobs.send(job).is_err() {
            warn!(bridge = %self.bridge, script = name, "Executor is gone, dropping script");
        }
    }

    fn placeholders(
        &self,
        bridge_interface: &str,
        peer_cidrs: &[Cidr],
        tunnel_interface: Option<&str>,
    ) -> common::Result<Vec<(&'static str, String)>> {
        let mut params = vec![(PLACEHOLDER_BRIDGE_INTERFACE, bridge_interface.to_string())];

        if let Some(tunnel_interface) = tunnel_interface {
            params.push((PLACEHOLDER_TUNNEL_INTERFACE, tunnel_interface.to_string()));
        }

        let Some((primary, extra)) = peer_cidrs.split_first() else {
            return Ok(params);
        };

        let ipv4 = primary.is_ipv4();
        params.push((PLACEHOLDER_BRIDGE_PEER_CIDR, primary.to_string()));
        params.push((PLACEHOLDER_PROTO, if ipv4 { "4" } else { "6" }.to_string()));
        params.push((
            PLACEHOLDER_BRIDGE_INTERFACE_IP,
            (self.lookup)(bridge_interface, ipv4)?.to_string(),
        ));

        if let Some(tunnel_interface) = tunnel_interface {
            params.push((
                PLACEHOLDER_TUNNEL_INTERFACE_IP,
                (self.lookup)(tunnel_interface, ipv4)?.to_string(),
            ));
        }

        if !extra.is_empty() {
            let extra: Vec<String> = extra.iter().map(Cidr::to_string).collect();
            params.push((PLACEHOLDER_BRIDGE_EXTRA_PEER_CIDRS, extra.join(",")));
        }

        Ok(params)
    }
}

impl Reconciler for ScriptReconciler {
    fn bridge_activate(&self, request: &BridgeActivation) {
        self.schedule(
            "bridge_activate",
            &self.bridge_activate,
            &request.bridge_interface,
            &request.peer_cidrs,
            None,
        );
    }

    fn interface_activate(&self, request: &InterfaceActivation) {
        self.schedule(
            "interface_activate",
            &self.interface_activate,
            &request.bridge_interface,
            &request.peer_cidrs,
            Some(&request.tunnel_interface),
        );
    }

    fn interface_deactivate(&self, request: &InterfaceActivation) {
        self.schedule(
            "interface_deactivate",
            &self.interface_deactivate,
            &request.bridge_interface,
            &request.peer_cidrs,
            Some(&request.tunnel_interface),
        );
    }
}

/// Substitute `${placeholder}` occurrences in every argument
pub fn render(source: &Script, params: &[(&str, String)]) -> Script {
    source
        .iter()
        .map(|command| {
            command
                .iter()
                .map(|arg| {
                    params.iter().fold(arg.clone(), |arg, (name, value)| {
                        arg.replace(&format!("${{{}}}", name), value)
                    })
                })
                .collect()
        })
        .collect()
}

/// First address of `interface` in the requested protocol family
pub fn interface_ip(interface: &str, ipv4: bool) -> common::Result<IpAddr> {
    let addrs = nix::ifaddrs::getifaddrs()
        .map_err(|e| common::Error::Io(std::io::Error::from(e)))?;

    let mut seen = false;
    for ifaddr in addrs.filter(|ifaddr| ifaddr.interface_name == interface) {
        seen = true;
        let Some(address) = ifaddr.address else {
            continue;
        };
        if ipv4 {
            if let Some(sin) = address.as_sockaddr_in() {
                return Ok(IpAddr::V4(sin.ip()));
            }
        } else if let Some(sin6) = address.as_sockaddr_in6() {
            return Ok(IpAddr::V6(sin6.ip()));
        }
    }

    if seen {
        Err(common::Error::reconcile(format!(
            "interface {} has no ipv{} address",
            interface,
            if ipv4 { 4 } else { 6 }
        )))
    } else {
        Err(common::Error::reconcile(format!("interface not found: {}", interface)))
    }
}

/// Runs rendered scripts strictly one at a time, in submission order
pub struct Executor {
    bridge: String,
    timeout: Duration,
    jobs: mpsc::UnboundedReceiver<Job>,
    metrics: Option<Arc<MetricsRegistry>>,
}

impl Executor {
    /// Execute jobs until cancelled or every reconciler handle is dropped
    pub async fn run(mut self, cancel: CancellationToken) {
        info!(bridge = %self.bridge, "Script executor started");

        loop {
            let job = tokio::select! {
                _ = cancel.cancelled() => break,
                job = self.jobs.recv() => match job {
                    Some(job) => job,
                    None => break,
                },
            };
            self.execute(&job).await;
        }

        info!(bridge = %self.bridge, "Script executor stopped");
    }

    /// Run every command of the job; failures are logged and counted
    pub async fn execute(&self, job: &Job) -> usize {
        let mut failures = 0;

        for (step, command) in job.script.iter().enumerate() {
            let Some((program, args)) = command.split_first() else {
                continue;
            };
            let line = command.join(" ");
            debug!(bridge = %self.bridge, script = job.name, command = %line, "Executing command");

            let start = Instant::now();
            let output = tokio::time::timeout(
                self.timeout,
                Command::new(program).args(args).kill_on_drop(true).output(),
            )
            .await;
            let duration_us = start.elapsed().as_micros() as u64;

            match output {
                Ok(Ok(output)) if output.status.success() => {
                    info!(
                        bridge = %self.bridge,
                        script = job.name,
                        step,
                        command = %line,
                        duration_us,
                        stdout = %String::from_utf8_lossy(&output.stdout).trim(),
                        stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                        "Executed command"
                    );
                }
                Ok(Ok(output)) => {
                    failures += 1;
                    error!(
                        bridge = %self.bridge,
                        script = job.name,
                        step,
                        command = %line,
                        duration_us,
                        status = %output.status,
                        stdout = %String::from_utf8_lossy(&output.stdout).trim(),
                        stderr = %String::from_utf8_lossy(&output.stderr).trim(),
                        "Command failed"
                    );
                }
                Ok(Err(e)) => {
                    failures += 1;
                    error!(
                        bridge = %self.bridge,
                        script = job.name,
                        step,
                        command = %line,
                        error = %e,
                        "Failed to spawn command"
                    );
                }
                Err(_) => {
                    failures += 1;
                    error!(
                        bridge = %self.bridge,
                        script = job.name,
                        step,
                        command = %line,
                        timeout = ?self.timeout,
                        "Command timed out"
                    );
                }
            }
        }

        if failures > 0 {
            if let Some(metrics) = &self.metrics {
                for _ in 0..failures {
                    metrics.record_error(&self.bridge, &format!("job_{}", job.name));
                }
            }
        }
        failures
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    const YAML: &str = r#"
bridges:
  vpn-1:
    role: active
    bridge_interface: eth0
    peer_cidrs: [10.1.0.0/16, 10.2.0.0/16, 10.3.0.0/16]
    status_addr: 127.0.0.1:8080
    partner_url: http://127.0.0.1:8081
    tunnel_interfaces:
      wg0: { role: active, addr: 127.0.0.1:3003, probe_addr: 127.0.0.1:3004 }
    reconcile:
      scripts_timeout: 2s
      bridge_activate:
        script:
          - [ip, "-${proto}", route, replace, "${bridge_peer_cidr}", via, "${bridge_interface_ip}"]
          - [echo, "${bridge_extra_peer_cidrs}"]
      interface_activate:
        script:
          - [echo, "${tunnel_interface}=${tunnel_interface_ip}"]
"#;

    fn fake_lookup(interface: &str, ipv4: bool) -> common::Result<IpAddr> {
        assert!(ipv4);
        match interface {
            "eth0" => Ok("192.168.1.10".parse().unwrap()),
            "wg0" => Ok("169.254.0.1".parse().unwrap()),
            other => Err(common::Error::reconcile(format!("interface not found: {}", other))),
        }
    }

    fn reconciler() -> (ScriptReconciler, Executor) {
        let config = Config::from_yaml(YAML).unwrap();
        let (reconciler, executor) = ScriptReconciler::new("vpn-1", &config.bridges["vpn-1"], None);
        (reconciler.with_lookup(fake_lookup), executor)
    }

    fn cidrs() -> Vec<Cidr> {
        vec![
            "10.1.0.0/16".parse().unwrap(),
            "10.2.0.0/16".parse().unwrap(),
            "10.3.0.0/16".parse().unwrap(),
        ]
    }

    #[test]
    fn test_render() {
        let script: Script = vec![vec!["echo".into(), "${a}-${b}-${a}".into(), "${missing}".into()]];
        let rendered = render(&script, &[("a", "1".to_string()), ("b", "2".to_string())]);
        assert_eq!(rendered, vec![vec!["echo", "1-2-1", "${missing}"]]);
    }

    #[test]
    fn test_bridge_activate_renders_script() {
        let (reconciler, mut executor) = reconciler();

        reconciler.bridge_activate(&BridgeActivation {
            bridge_interface: "eth0".to_string(),
            peer_cidrs: cidrs(),
            iteration: 0,
        });

        let job = executor.jobs.try_recv().unwrap();
        assert_eq!(job.name, "bridge_activate");
        assert_eq!(
            job.script[0],
            vec!["ip", "-4", "route", "replace", "10.1.0.0/16", "via", "192.168.1.10"]
        );
        assert_eq!(job.script[1], vec!["echo", "10.2.0.0/16,10.3.0.0/16"]);
    }

    #[test]
    fn test_interface_activate_renders_script() {
        let (reconciler, mut executor) = reconciler();

        reconciler.interface_activate(&InterfaceActivation {
            bridge_interface: "eth0".to_string(),
            peer_cidrs: cidrs(),
            tunnel_interface: "wg0".to_string(),
            iteration: 0,
        });

        let job = executor.jobs.try_recv().unwrap();
        assert_eq!(job.script, vec![vec!["echo", "wg0=169.254.0.1"]]);
    }

    #[test]
    fn test_empty_script_is_skipped() {
        let (reconciler, mut executor) = reconciler();

        reconciler.interface_deactivate(&InterfaceActivation {
            bridge_interface: "eth0".to_string(),
            peer_cidrs: cidrs(),
            tunnel_interface: "wg0".to_string(),
            iteration: 0,
        });

        assert!(executor.jobs.try_recv().is_err());
    }

    #[test]
    fn test_failed_lookup_drops_job() {
        let (reconciler, mut executor) = reconciler();

        reconciler.interface_activate(&InterfaceActivation {
            bridge_interface: "eth0".to_string(),
            peer_cidrs: cidrs(),
            tunnel_interface: "wg9".to_string(),
            iteration: 0,
        });

        assert!(executor.jobs.try_recv().is_err());
    }

    #[test]
    fn test_unknown_interface_lookup() {
        assert!(interface_ip("definitely-not-an-interface0", true).is_err());
    }

    #[tokio::test]
    async fn test_executor_counts_failures() {
        let (_, executor) = reconciler();

        let job = Job {
            name: "test",
            script: vec![
                vec!["true".to_string()],
                vec![],
                vec!["false".to_string()],
                vec!["/nonexistent/command".to_string()],
            ],
        };
        assert_eq!(executor.execute(&job).await, 2);
    }

    #[tokio::test]
    async fn test_executor_times_out() {
        let (_, mut executor) = reconciler();
        executor.timeout = Duration::from_millis(100);

        let job = Job {
            name: "test",
            script: vec![vec!["sleep".to_string(), "5".to_string()]],
        };
        let start = Instant::now();
        assert_eq!(executor.execute(&job).await, 1);
        assert!(start.elapsed() < Duration::from_secs(4));
    }
}
