//! Host network configuration for the TUN front-end
//!
//! Setup saves and raises a few sysctls, installs iptables accept/NAT rules,
//! optionally routes everything through the device, then assigns the device
//! address and brings the link up. Every step that succeeds is recorded so
//! teardown reverses exactly those steps, in reverse order.

use async_trait::async_trait;
use std::net::Ipv4Addr;
use thiserror::Error;
use tracing::{debug, info, warn};

const SYSCTLS: [(&str, &str); 3] = [
    ("net.ipv4.ip_forward", "1"),
    ("net.core.rmem_max", "26214400"),
    ("net.core.wmem_max", "26214400"),
];

#[derive(Debug, Error)]
pub enum NetConfigError {
    #[error("Failed to run {command}: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{command} exited with {status}: {stderr}")]
    CommandFailed {
        command: String,
        status: String,
        stderr: String,
    },
}

/// Runs external network tools. Returns trimmed stdout.
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, program: &str, args: &[String]) -> Result<String, NetConfigError>;
}

/// Runs commands on the host with `tokio::process`
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, program: &str, args: &[String]) -> Result<String, NetConfigError> {
        let command = render(program, args);
        debug!(command = %command, "Running network command");

        let output = tokio::process::Command::new(program)
            .args(args)
            .output()
            .await
            .map_err(|source| NetConfigError::Spawn {
                command: command.clone(),
                source,
            })?;

        if !output.status.success() {
            return Err(NetConfigError::CommandFailed {
                command,
                status: output.status.to_string(),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

fn render(program: &str, args: &[String]) -> String {
    std::iter::once(program.to_string())
        .chain(args.iter().cloned())
        .collect::<Vec<_>>()
        .join(" ")
}

/// One iptables rule, kept as arguments rather than a command string
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IptablesRule {
    pub table: Option<&'static str>,
    pub chain: &'static str,
    pub spec: Vec<String>,
}

impl IptablesRule {
    fn new(table: Option<&'static str>, chain: &'static str, spec: &[&str]) -> Self {
        Self {
            table,
            chain,
            spec: spec.iter().map(|s| s.to_string()).collect(),
        }
    }

    /// Arguments for `iptables` with `action` (`-A` or `-D`)
    pub fn args(&self, action: &str) -> Vec<String> {
        let mut args = Vec::with_capacity(self.spec.len() + 4);
        if let Some(table) = self.table {
            args.push("-t".to_string());
            args.push(table.to_string());
        }
        args.push(action.to_string());
        args.push(self.chain.to_string());
        args.extend(self.spec.iter().cloned());
        args
    }
}

/// Accept traffic on `device` and masquerade it out of `egress`
pub fn iptables_rules(device: &str, egress: &str) -> Vec<IptablesRule> {
    vec![
        IptablesRule::new(None, "INPUT", &["-i", device, "-j", "ACCEPT"]),
        IptablesRule::new(None, "OUTPUT", &["-o", device, "-j", "ACCEPT"]),
        IptablesRule::new(Some("nat"), "POSTROUTING", &["-o", egress, "-j", "MASQUERADE"]),
        IptablesRule::new(
            None,
            "FORWARD",
            &["-i", device, "-o", egress, "-j", "ACCEPT"],
        ),
        IptablesRule::new(
            None,
            "FORWARD",
            &[
                "-i",
                egress,
                "-o",
                device,
                "-m",
                "state",
                "--state",
                "RELATED,ESTABLISHED",
                "-j",
                "ACCEPT",
            ],
        ),
    ]
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Applied {
    Sysctl { key: String, original: String },
    Rule(IptablesRule),
    DefaultRoute,
    Address,
    LinkUp,
}

#[derive(Debug)]
pub struct NetworkConfigurator {
    device: String,
    address: Ipv4Addr,
    egress: String,
    route_all: bool,
    applied: Vec<Applied>,
}

impl NetworkConfigurator {
    pub fn new(
        device: impl Into<String>,
        address: Ipv4Addr,
        egress: impl Into<String>,
        route_all: bool,
    ) -> Self {
        Self {
            device: device.into(),
            address,
            egress: egress.into(),
            route_all,
            applied: Vec::new(),
        }
    }

    /// Steps applied so far
    pub fn applied_steps(&self) -> usize {
        self.applied.len()
    }

    /// Apply the configuration, stopping at the first failing step.
    ///
    /// Steps applied before a failure stay recorded; call
    /// [`teardown`](Self::teardown) to undo them.
    pub async fn setup(&mut self, runner: &dyn CommandRunner) -> Result<(), NetConfigError> {
        info!(device = %self.device, address = %self.address, "Configuring host network");

        for (key, value) in SYSCTLS {
            let original = runner.run("sysctl", &args(&["-n", key])).await?;
            runner
                .run("sysctl", &args(&["-w", &format!("{}={}", key, value)]))
                .await?;
            debug!(key, original = %original, value, "sysctl set");
            self.applied.push(Applied::Sysctl {
                key: key.to_string(),
                original,
            });
        }

        for rule in iptables_rules(&self.device, &self.egress) {
            runner.run("iptables", &rule.args("-A")).await?;
            debug!(rule = ?rule.args("-A"), "iptables rule added");
            self.applied.push(Applied::Rule(rule));
        }

        if self.route_all {
            runner.run("ip", &self.route_args("add")).await?;
            self.applied.push(Applied::DefaultRoute);
        }

        let cidr = format!("{}/24", self.address);
        runner
            .run("ip", &args(&["addr", "add", &cidr, "dev", &self.device]))
            .await?;
        self.applied.push(Applied::Address);

        runner
            .run("ip", &args(&["link", "set", "dev", &self.device, "up"]))
            .await?;
        self.applied.push(Applied::LinkUp);

        info!(device = %self.device, "Host network configured");
        Ok(())
    }

    /// Undo every applied step in reverse order. Failures are logged and
    /// the remaining steps still run.
    pub async fn teardown(&mut self, runner: &dyn CommandRunner) {
        if self.applied.is_empty() {
            return;
        }
        info!(device = %self.device, steps = self.applied.len(), "Restoring host network");

        while let Some(step) = self.applied.pop() {
            let result = match &step {
                Applied::LinkUp => {
                    runner
                        .run("ip", &args(&["link", "set", "dev", &self.device, "down"]))
                        .await
                }
                Applied::Address => {
                    let cidr = format!("{}/24", self.address);
                    runner
                        .run("ip", &args(&["addr", "del", &cidr, "dev", &self.device]))
                        .await
                }
                Applied::DefaultRoute => runner.run("ip", &self.route_args("del")).await,
                Applied::Rule(rule) => runner.run("iptables", &rule.args("-D")).await,
                Applied::Sysctl { key, original } => {
                    runner
                        .run("sysctl", &args(&["-w", &format!("{}={}", key, original)]))
                        .await
                }
            };

            if let Err(e) = result {
                warn!(step = ?step, "Failed to undo network step: {}", e);
            }
        }
    }

    fn route_args(&self, action: &str) -> Vec<String> {
        args(&["route", action, "0.0.0.0/0", "dev", &self.device])
    }
}

fn args(parts: &[&str]) -> Vec<String> {
    parts.iter().map(|s| s.to_string()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Records commands; fails any command containing `fail_on`
    #[derive(Default)]
    struct RecordingRunner {
        commands: Mutex<Vec<String>>,
        fail_on: Option<&'static str>,
    }

    impl RecordingRunner {
        fn failing_on(pattern: &'static str) -> Self {
            Self {
                fail_on: Some(pattern),
                ..Self::default()
            }
        }

        fn commands(&self) -> Vec<String> {
            self.commands.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl CommandRunner for RecordingRunner {
        async fn run(&self, program: &str, args: &[String]) -> Result<String, NetConfigError> {
            let command = render(program, args);
            self.commands.lock().unwrap().push(command.clone());
            if let Some(pattern) = self.fail_on {
                if command.contains(pattern) {
                    return Err(NetConfigError::CommandFailed {
                        command,
                        status: "exit status: 1".to_string(),
                        stderr: "refused".to_string(),
                    });
                }
            }
            Ok("0".to_string())
        }
    }

    fn configurator(route_all: bool) -> NetworkConfigurator {
        NetworkConfigurator::new("tun0", Ipv4Addr::new(10, 0, 0, 1), "eth0", route_all)
    }

    #[test]
    fn test_rule_args() {
        let rules = iptables_rules("tun0", "eth0");
        assert_eq!(rules.len(), 5);
        assert_eq!(
            rules[0].args("-A"),
            vec!["-A", "INPUT", "-i", "tun0", "-j", "ACCEPT"]
        );
        assert_eq!(
            rules[2].args("-D"),
            vec!["-t", "nat", "-D", "POSTROUTING", "-o", "eth0", "-j", "MASQUERADE"]
        );
    }

    #[tokio::test]
    async fn test_setup_and_teardown_mirror_each_other() {
        let runner = RecordingRunner::default();
        let mut net = configurator(false);

        net.setup(&runner).await.unwrap();
        let setup = runner.commands();
        assert_eq!(setup[0], "sysctl -n net.ipv4.ip_forward");
        assert_eq!(setup[1], "sysctl -w net.ipv4.ip_forward=1");
        assert!(setup.contains(&"ip addr add 10.0.0.1/24 dev tun0".to_string()));
        assert_eq!(setup.last().unwrap(), "ip link set dev tun0 up");
        assert!(!setup.iter().any(|c| c.starts_with("ip route")));

        net.teardown(&runner).await;
        let teardown: Vec<String> = runner.commands()[setup.len()..].to_vec();
        assert_eq!(teardown[0], "ip link set dev tun0 down");
        assert_eq!(teardown[1], "ip addr del 10.0.0.1/24 dev tun0");
        assert!(teardown.contains(&"iptables -t nat -D POSTROUTING -o eth0 -j MASQUERADE".to_string()));
        assert_eq!(teardown.last().unwrap(), "sysctl -w net.ipv4.ip_forward=0");
        assert_eq!(net.applied_steps(), 0);
    }

    #[tokio::test]
    async fn test_route_all_adds_default_route() {
        let runner = RecordingRunner::default();
        let mut net = configurator(true);

        net.setup(&runner).await.unwrap();
        assert!(runner
            .commands()
            .contains(&"ip route add 0.0.0.0/0 dev tun0".to_string()));

        net.teardown(&runner).await;
        assert!(runner
            .commands()
            .contains(&"ip route del 0.0.0.0/0 dev tun0".to_string()));
    }

    #[tokio::test]
    async fn test_teardown_reverses_only_applied_steps() {
        let runner = RecordingRunner::failing_on("MASQUERADE");
        let mut net = configurator(true);

        assert!(net.setup(&runner).await.is_err());
        // Three sysctls and two rules made it
        assert_eq!(net.applied_steps(), 5);

        let before = runner.commands().len();
        net.teardown(&runner).await;
        let teardown: Vec<String> = runner.commands()[before..].to_vec();

        assert_eq!(
            teardown,
            vec![
                "iptables -D OUTPUT -o tun0 -j ACCEPT",
                "iptables -D INPUT -i tun0 -j ACCEPT",
                "sysctl -w net.core.wmem_max=0",
                "sysctl -w net.core.rmem_max=0",
                "sysctl -w net.ipv4.ip_forward=0",
            ]
        );
    }

    #[tokio::test]
    async fn test_teardown_continues_after_failures() {
        let runner = RecordingRunner::failing_on("iptables -D");
        let mut net = configurator(false);

        // Setup uses -A, so only the deletes fail
        net.setup(&runner).await.unwrap();
        net.teardown(&runner).await;

        let commands = runner.commands();
        assert_eq!(commands.last().unwrap(), "sysctl -w net.ipv4.ip_forward=0");
        assert_eq!(net.applied_steps(), 0);
    }
}
