//! Reachability probes for trusted servers and the delegate IP.

use crate::command::{CommandOutput, CommandRunner, ExitKind, shell};
use crate::template::expand_percent;
use futures::stream::{FuturesUnordered, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// Probe settings.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ProbeConfig {
    /// Directory holding the `ping` binary
    pub ping_path: String,

    /// Shell template run instead of ping for trusted servers (`%h` is the host)
    pub trusted_server_command: String,
}

impl Default for ProbeConfig {
    fn default() -> Self {
        Self {
            ping_path: "/bin".to_string(),
            trusted_server_command: String::new(),
        }
    }
}

/// Pings hosts through a [`CommandRunner`].
#[derive(Clone)]
pub struct TrustedServerProbe {
    config: ProbeConfig,
    runner: Arc<dyn CommandRunner>,
}

impl std::fmt::Debug for TrustedServerProbe {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TrustedServerProbe")
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl TrustedServerProbe {
    pub fn new(config: ProbeConfig, runner: Arc<dyn CommandRunner>) -> Self {
        Self { config, runner }
    }

    /// `<ping_path>/ping -q -c3 <host>`
    pub fn ping_argv(&self, host: &str) -> Vec<String> {
        vec![
            format!("{}/ping", self.config.ping_path.trim_end_matches('/')),
            "-q".to_string(),
            "-c3".to_string(),
            host.to_string(),
        ]
    }

    /// Ping `host` once and report whether it answered.
    pub async fn probe(&self, host: &str) -> bool {
        debug!(host, "trying to ping host");

        match self.runner.run(&self.ping_argv(host)).await {
            Ok(output) => classify_ping(host, &output),
            Err(e) => {
                warn!(host, error = %e, "failed to ping host");
                false
            }
        }
    }

    /// Check a trusted server, with `trusted_server_command` when one is
    /// configured and with ping otherwise.
    pub async fn probe_trusted(&self, host: &str) -> bool {
        if self.config.trusted_server_command.is_empty() {
            return self.probe(host).await;
        }

        let cmd = expand_percent(&self.config.trusted_server_command, host);
        debug!(command = %cmd, "trusted_server_command");

        match self.runner.run(&shell(&cmd)).await {
            Ok(output) if output.success() => true,
            Ok(output) => {
                debug!(host, status = ?output.status, "trusted_server_command failed");
                false
            }
            Err(e) => {
                warn!(host, error = %e, "failed to run trusted_server_command");
                false
            }
        }
    }
}

/// Reachable only after a normal zero exit whose output has a
/// non-negative average round trip time.
pub fn classify_ping(host: &str, output: &CommandOutput) -> bool {
    match output.status {
        ExitKind::Signaled(signal) => {
            warn!(host, signal, "ping process exited abnormally");
            false
        }
        ExitKind::Exited(code) if code != 0 => {
            warn!(host, exit_code = code, "ping process exited with failure");
            false
        }
        ExitKind::Exited(_) => match parse_average_rtt(&output.stdout) {
            Some(avg) => {
                debug!(host, avg_ms = avg, "succeeded to ping host");
                true
            }
            None => {
                warn!(host, "ping output has no usable average round trip time");
                false
            }
        },
    }
}

/// Average of a `min/avg/max/... = a/b/c/d ms` summary line.
pub fn parse_average_rtt(output: &str) -> Option<f64> {
    let line = output.lines().find(|l| l.contains("min/avg/max"))?;
    let (_, values) = line.split_once('=')?;
    let avg: f64 = values.trim().split('/').nth(1)?.trim().parse().ok()?;

    if avg.is_finite() && avg >= 0.0 {
        Some(avg)
    } else {
        None
    }
}

/// Operator-designated hosts used to tell a dead peer from a dead local
/// network.
#[derive(Debug, Clone, Default)]
pub struct TrustedServers {
    servers: Vec<String>,
}

impl TrustedServers {
    pub fn new(servers: Vec<String>) -> Self {
        Self { servers }
    }

    pub fn is_empty(&self) -> bool {
        self.servers.is_empty()
    }

    pub fn servers(&self) -> &[String] {
        &self.servers
    }

    /// Probe every server concurrently and return as soon as one answers.
    ///
    /// `None` when no server is configured; the caller picks the fallback.
    pub async fn any_reachable(&self, probe: &TrustedServerProbe) -> Option<bool> {
        if self.servers.is_empty() {
            return None;
        }

        let mut pending: FuturesUnordered<_> = self
            .servers
            .iter()
            .map(|host| async move { (host, probe.probe_trusted(host).await) })
            .collect();

        while let Some((host, reachable)) = pending.next().await {
            if reachable {
                debug!(host = %host, "trusted server is reachable");
                return Some(true);
            }
        }

        info!(servers = ?self.servers, "none of the trusted servers is reachable");
        Some(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::MockCommandRunner;

    const LINUX_OUTPUT: &str = "PING db1 (10.0.0.1) 56(84) bytes of data.\n\n\
        --- db1 ping statistics ---\n\
        3 packets transmitted, 3 received, 0% packet loss, time 2003ms\n\
        rtt min/avg/max/mdev = 0.045/0.052/0.061/0.006 ms\n";

    const BSD_OUTPUT: &str = "--- db1 ping statistics ---\n\
        3 packets transmitted, 3 packets received, 0.0% packet loss\n\
        round-trip min/avg/max/stddev = 0.110/0.131/0.160/0.021 ms\n";

    fn probe_returning(output: CommandOutput) -> TrustedServerProbe {
        let mut runner = MockCommandRunner::new();
        runner.expect_run().returning(move |_| Ok(output.clone()));
        TrustedServerProbe::new(ProbeConfig::default(), Arc::new(runner))
    }

    #[test]
    fn test_parse_average_rtt() {
        assert_eq!(parse_average_rtt(LINUX_OUTPUT), Some(0.052));
        assert_eq!(parse_average_rtt(BSD_OUTPUT), Some(0.131));
        assert_eq!(parse_average_rtt(""), None);
        assert_eq!(parse_average_rtt("rtt min/avg/max/mdev = a/b/c/d ms"), None);
        assert_eq!(parse_average_rtt("rtt min/avg/max/mdev = 1.0"), None);
        assert_eq!(parse_average_rtt("rtt min/avg/max/mdev = 1/-2/3/4 ms"), None);
    }

    #[tokio::test]
    async fn test_probe_classification() {
        assert!(probe_returning(CommandOutput::exited(0, LINUX_OUTPUT)).probe("db1").await);
        assert!(!probe_returning(CommandOutput::exited(1, LINUX_OUTPUT)).probe("db1").await);
        assert!(!probe_returning(CommandOutput::signaled(9)).probe("db1").await);
        assert!(
            !probe_returning(CommandOutput::exited(0, "3 packets transmitted, 3 received"))
                .probe("db1")
                .await
        );
    }

    #[tokio::test]
    async fn test_probe_spawn_error() {
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .returning(|_| Err(common::Error::command("no such file")));
        let probe = TrustedServerProbe::new(ProbeConfig::default(), Arc::new(runner));
        assert!(!probe.probe("db1").await);
    }

    #[tokio::test]
    async fn test_ping_argv() {
        let config = ProbeConfig {
            ping_path: "/usr/bin/".to_string(),
            ..Default::default()
        };
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .withf(|argv: &[String]| argv == ["/usr/bin/ping", "-q", "-c3", "db1"])
            .times(1)
            .returning(|_| Ok(CommandOutput::exited(0, LINUX_OUTPUT)));

        let probe = TrustedServerProbe::new(config, Arc::new(runner));
        assert!(probe.probe("db1").await);
    }

    #[tokio::test]
    async fn test_trusted_server_command() {
        let config = ProbeConfig {
            trusted_server_command: "check-host %h 100%%".to_string(),
            ..Default::default()
        };
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .withf(|argv: &[String]| argv == ["/bin/sh", "-c", "check-host db1 100%"])
            .times(1)
            .returning(|_| Ok(CommandOutput::exited(0, "")));
        runner
            .expect_run()
            .withf(|argv: &[String]| argv[2] == "check-host db2 100%")
            .times(1)
            .returning(|_| Ok(CommandOutput::exited(2, "")));

        let probe = TrustedServerProbe::new(config, Arc::new(runner));
        assert!(probe.probe_trusted("db1").await);
        assert!(!probe.probe_trusted("db2").await);
    }

    #[tokio::test]
    async fn test_any_reachable() {
        let mut runner = MockCommandRunner::new();
        runner.expect_run().returning(|argv| {
            if argv[3] == "up" {
                Ok(CommandOutput::exited(0, LINUX_OUTPUT))
            } else {
                Ok(CommandOutput::exited(1, ""))
            }
        });
        let probe = TrustedServerProbe::new(ProbeConfig::default(), Arc::new(runner));

        assert_eq!(TrustedServers::default().any_reachable(&probe).await, None);

        let down = TrustedServers::new(vec!["down1".into(), "down2".into()]);
        assert_eq!(down.any_reachable(&probe).await, Some(false));

        let mixed = TrustedServers::new(vec!["down1".into(), "up".into()]);
        assert_eq!(mixed.any_reachable(&probe).await, Some(true));
    }
}
