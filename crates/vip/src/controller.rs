//! Delegate IP ownership and escalation hooks.

use crate::command::{CommandRunner, run_logged, shell};
use crate::probe::{ProbeConfig, TrustedServerProbe};
use crate::template::{resolve_command, split_command};
use async_trait::async_trait;
use common::{Error, Result};
use serde::Deserialize;
use std::os::unix::fs::MetadataExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

const S_ISUID: u32 = 0o4000;

/// Delegate IP settings and command templates.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct VipConfig {
    /// Floating address held by the leader; empty disables IP handling
    pub delegate_ip: String,

    /// Base directory for `if_up_cmd` and `if_down_cmd`
    pub if_cmd_path: String,

    /// Command bringing the delegate IP up (`$_IP_$` is the address)
    pub if_up_cmd: String,

    /// Command bringing the delegate IP down
    pub if_down_cmd: String,

    /// Base directory for `arping_cmd`
    pub arping_path: String,

    /// Gratuitous ARP command run after `if_up_cmd`
    pub arping_cmd: String,

    /// Directory holding the `ping` binary
    pub ping_path: String,

    /// Shell command run on becoming leader
    pub escalation_command: String,

    /// Shell command run on losing leadership
    pub de_escalation_command: String,

    /// Run the cache clear hook before escalating
    pub clear_memqcache_on_escalation: bool,

    /// Pings of the delegate IP after bringing it up
    pub ip_poll_attempts: u32,

    /// Pause between two pings of the delegate IP
    #[serde(with = "humantime_serde")]
    pub ip_poll_interval: Duration,
}

impl Default for VipConfig {
    fn default() -> Self {
        Self {
            delegate_ip: String::new(),
            if_cmd_path: "/sbin".to_string(),
            if_up_cmd: "/usr/bin/sudo /sbin/ip addr add $_IP_$/24 dev eth0 label eth0:0".to_string(),
            if_down_cmd: "/usr/bin/sudo /sbin/ip addr del $_IP_$/24 dev eth0".to_string(),
            arping_path: "/usr/sbin".to_string(),
            arping_cmd: "/usr/bin/sudo /usr/sbin/arping -U $_IP_$ -w 1 -I eth0".to_string(),
            ping_path: "/bin".to_string(),
            escalation_command: String::new(),
            de_escalation_command: String::new(),
            clear_memqcache_on_escalation: true,
            ip_poll_attempts: 3,
            ip_poll_interval: Duration::from_secs(1),
        }
    }
}

impl VipConfig {
    pub fn has_delegate_ip(&self) -> bool {
        !self.delegate_ip.is_empty()
    }
}

/// Hook clearing the query cache when this node escalates.
#[async_trait]
pub trait CacheClearHook: Send + Sync {
    async fn clear(&self);
}

/// Runs the commands that move the delegate IP.
pub struct VipController {
    config: VipConfig,
    runner: Arc<dyn CommandRunner>,
    probe: TrustedServerProbe,
    cache_hook: Option<Arc<dyn CacheClearHook>>,
}

impl std::fmt::Debug for VipController {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VipController")
            .field("config", &self.config)
            .field("cache_hook", &self.cache_hook.is_some())
            .finish_non_exhaustive()
    }
}

impl VipController {
    pub fn new(config: VipConfig, runner: Arc<dyn CommandRunner>) -> Self {
        let probe = TrustedServerProbe::new(
            ProbeConfig {
                ping_path: config.ping_path.clone(),
                ..Default::default()
            },
            Arc::clone(&runner),
        );
        Self {
            config,
            runner,
            probe,
            cache_hook: None,
        }
    }

    pub fn with_cache_hook(mut self, hook: Arc<dyn CacheClearHook>) -> Self {
        self.cache_hook = Some(hook);
        self
    }

    pub fn config(&self) -> &VipConfig {
        &self.config
    }

    /// Bring the delegate IP up: `if_up_cmd`, then `arping_cmd`, then ping
    /// the address until it answers. Stops at the first failing step.
    pub async fn acquire(&self) -> bool {
        if !self.config.has_delegate_ip() {
            info!("trying to acquire the delegate IP address, but delegate IP is not configured");
            return true;
        }

        let ok = self
            .run_if_cmd("if_up_cmd", &self.config.if_up_cmd, &self.config.if_cmd_path)
            .await
            && self
                .run_if_cmd("arping_cmd", &self.config.arping_cmd, &self.config.arping_path)
                .await
            && self.wait_for_ip().await;

        if ok {
            info!(delegate_ip = %self.config.delegate_ip, "successfully acquired the delegate IP");
        } else {
            info!(delegate_ip = %self.config.delegate_ip, "failed to acquire the delegate IP address");
        }
        ok
    }

    /// Bring the delegate IP down with `if_down_cmd`.
    pub async fn release(&self) -> bool {
        if !self.config.has_delegate_ip() {
            info!("trying to release the delegate IP address, but delegate IP is not configured");
            return true;
        }

        let ok = self
            .run_if_cmd("if_down_cmd", &self.config.if_down_cmd, &self.config.if_cmd_path)
            .await;

        if ok {
            info!(delegate_ip = %self.config.delegate_ip, "successfully released the delegate IP");
        } else {
            info!(delegate_ip = %self.config.delegate_ip, "failed to release the delegate IP");
        }
        ok
    }

    /// Steps run on becoming leader. Returns false if any step failed.
    pub async fn escalate(&self) -> bool {
        info!("watchdog: escalation started");

        if self.config.clear_memqcache_on_escalation {
            if let Some(hook) = &self.cache_hook {
                info!("watchdog escalation: clearing all the query cache on shared memory");
                hook.clear().await;
            }
        }

        let mut ok = true;
        if !self.config.escalation_command.is_empty() {
            ok = run_logged(
                self.runner.as_ref(),
                "escalation_command",
                &shell(&self.config.escalation_command),
            )
            .await;
            if ok {
                info!("watchdog escalation successful");
            } else {
                warn!("watchdog escalation command failed");
            }
        }

        if self.config.has_delegate_ip() && !self.acquire().await {
            warn!("watchdog escalation failed to acquire delegate IP");
            ok = false;
        }

        ok
    }

    /// Steps run on losing leadership. Returns false if any step failed.
    pub async fn deescalate(&self) -> bool {
        info!("watchdog: de-escalation started");

        let mut ok = true;
        if !self.config.de_escalation_command.is_empty() {
            ok = run_logged(
                self.runner.as_ref(),
                "de_escalation_command",
                &shell(&self.config.de_escalation_command),
            )
            .await;
            if ok {
                info!("watchdog de-escalation successful");
            } else {
                warn!("watchdog de-escalation command failed");
            }
        }

        if self.config.has_delegate_ip() && !self.release().await {
            warn!("watchdog de-escalation failed to bring down delegate IP");
            ok = false;
        }

        ok
    }

    /// Run [`escalate`](Self::escalate) on its own task.
    pub fn spawn_escalation(self: &Arc<Self>) -> JoinHandle<bool> {
        let this = Arc::clone(self);
        tokio::spawn(async move { this.escalate().await })
    }

    /// Run [`deescalate`](Self::deescalate) on its own task.
    pub fn spawn_deescalation(self: &Arc<Self>) -> JoinHandle<bool> {
        let this = Arc::clone(self);
        tokio::spawn(async move { this.deescalate().await })
    }

    /// Check that the interface commands exist under their base
    /// directories. Commands given as absolute paths are not checked.
    /// A command that is not setuid root is only warned about.
    pub fn check_command_permissions(&self) -> Result<()> {
        if !self.config.has_delegate_ip() {
            return Ok(());
        }

        let commands = [
            ("if_up_cmd", &self.config.if_up_cmd, &self.config.if_cmd_path),
            ("if_down_cmd", &self.config.if_down_cmd, &self.config.if_cmd_path),
            ("arping_cmd", &self.config.arping_cmd, &self.config.arping_path),
        ];

        for (name, template, base_dir) in commands {
            let Some(program) = split_command(template).into_iter().next() else {
                return Err(Error::config(format!(
                    "invalid configuration for {} parameter: unable to get command from \"{}\"",
                    name, template
                )));
            };
            if program.starts_with('/') {
                continue;
            }

            let path = format!("{}/{}", base_dir.trim_end_matches('/'), program);
            let meta = std::fs::metadata(&path).map_err(|e| {
                Error::config(format!("{} [{}] cannot be accessed: {}", name, path, e))
            })?;

            if meta.mode() & S_ISUID == 0 || meta.uid() != 0 {
                warn!(command = name, path = %path, "command doesn't have setuid bit");
            }
        }

        Ok(())
    }

    async fn run_if_cmd(&self, name: &str, template: &str, base_dir: &str) -> bool {
        let argv = match resolve_command(template, base_dir, &self.config.delegate_ip) {
            Ok(argv) => argv,
            Err(e) => {
                info!(command = name, error = %e, "failed to parse command");
                return false;
            }
        };
        run_logged(self.runner.as_ref(), name, &argv).await
    }

    async fn wait_for_ip(&self) -> bool {
        for attempt in 1..=self.config.ip_poll_attempts {
            if self.probe.probe(&self.config.delegate_ip).await {
                return true;
            }
            info!(attempt, "waiting for the delegate IP address to become active");
            if attempt < self.config.ip_poll_attempts {
                tokio::time::sleep(self.config.ip_poll_interval).await;
            }
        }
        debug!(delegate_ip = %self.config.delegate_ip, "delegate IP did not answer");
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::command::{CommandOutput, MockCommandRunner};
    use std::sync::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};

    const PING_OK: &str = "rtt min/avg/max/mdev = 0.045/0.052/0.061/0.006 ms\n";

    /// Records every command line and answers by program name.
    #[derive(Default)]
    struct RecordingRunner {
        calls: Mutex<Vec<String>>,
        fail: Vec<&'static str>,
    }

    impl RecordingRunner {
        fn failing(fail: Vec<&'static str>) -> Self {
            Self {
                calls: Mutex::new(Vec::new()),
                fail,
            }
        }

        fn calls(&self) -> Vec<String> {
            self.calls.lock().unwrap().clone()
        }
    }

    #[async_trait]
    impl CommandRunner for RecordingRunner {
        async fn run(&self, argv: &[String]) -> Result<CommandOutput> {
            let line = argv.join(" ");
            self.calls.lock().unwrap().push(line.clone());
            if self.fail.iter().any(|f| line.contains(f)) {
                return Ok(CommandOutput::exited(1, ""));
            }
            if argv[0].ends_with("/ping") {
                return Ok(CommandOutput::exited(0, PING_OK));
            }
            Ok(CommandOutput::exited(0, ""))
        }
    }

    fn config() -> VipConfig {
        VipConfig {
            delegate_ip: "10.0.0.50".to_string(),
            if_up_cmd: "/sbin/ip addr add $_IP_$/24 dev eth0".to_string(),
            if_down_cmd: "ip addr del $_IP_$/24 dev eth0".to_string(),
            arping_cmd: "arping -U $_IP_$ -w 1".to_string(),
            ip_poll_interval: Duration::ZERO,
            ..Default::default()
        }
    }

    fn controller(runner: &Arc<RecordingRunner>, config: VipConfig) -> VipController {
        VipController::new(config, Arc::clone(runner) as Arc<dyn CommandRunner>)
    }

    #[tokio::test]
    async fn test_acquire_first_command() {
        let mut runner = MockCommandRunner::new();
        let mut seq = mockall::Sequence::new();
        runner
            .expect_run()
            .withf(|argv: &[String]| argv.join(" ") == "/sbin/ip addr add 10.0.0.50/24 dev eth0")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(CommandOutput::exited(0, "")));
        runner
            .expect_run()
            .withf(|argv: &[String]| argv.join(" ") == "/usr/sbin/arping -U 10.0.0.50 -w 1")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(CommandOutput::exited(0, "")));
        runner
            .expect_run()
            .withf(|argv: &[String]| argv == ["/bin/ping", "-q", "-c3", "10.0.0.50"])
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_| Ok(CommandOutput::exited(0, PING_OK)));

        let vip = VipController::new(config(), Arc::new(runner));
        assert!(vip.acquire().await);
    }

    #[tokio::test]
    async fn test_acquire_short_circuits_on_if_up_failure() {
        let mut runner = MockCommandRunner::new();
        runner
            .expect_run()
            .withf(|argv: &[String]| argv[0] == "/sbin/ip")
            .times(1)
            .returning(|_| Ok(CommandOutput::exited(2, "")));
        runner
            .expect_run()
            .withf(|argv: &[String]| argv[0].ends_with("arping"))
            .never();

        let vip = VipController::new(config(), Arc::new(runner));
        assert!(!vip.acquire().await);
    }

    #[tokio::test]
    async fn test_acquire_short_circuits_on_arping_failure() {
        let runner = Arc::new(RecordingRunner::failing(vec!["arping"]));
        assert!(!controller(&runner, config()).acquire().await);
        assert_eq!(runner.calls().len(), 2);
    }

    #[tokio::test]
    async fn test_acquire_polls_ip() {
        let pings = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&pings);

        let mut runner = MockCommandRunner::new();
        runner.expect_run().returning(move |argv| {
            if argv[0] == "/bin/ping" {
                // answers on the third attempt
                if counter.fetch_add(1, Ordering::SeqCst) < 2 {
                    return Ok(CommandOutput::exited(1, ""));
                }
                return Ok(CommandOutput::exited(0, PING_OK));
            }
            Ok(CommandOutput::exited(0, ""))
        });

        let vip = VipController::new(config(), Arc::new(runner));
        assert!(vip.acquire().await);
        assert_eq!(pings.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_acquire_fails_when_ip_never_answers() {
        let runner = Arc::new(RecordingRunner::failing(vec!["/bin/ping"]));
        assert!(!controller(&runner, config()).acquire().await);

        let pings = runner.calls().iter().filter(|c| c.starts_with("/bin/ping")).count();
        assert_eq!(pings, 3);
    }

    #[tokio::test]
    async fn test_release_resolves_base_dir() {
        let runner = Arc::new(RecordingRunner::default());
        assert!(controller(&runner, config()).release().await);
        assert_eq!(runner.calls(), vec!["/sbin/ip addr del 10.0.0.50/24 dev eth0"]);
    }

    #[tokio::test]
    async fn test_no_delegate_ip_runs_nothing() {
        let runner = Arc::new(RecordingRunner::default());
        let vip = controller(
            &runner,
            VipConfig {
                delegate_ip: String::new(),
                ..config()
            },
        );
        assert!(vip.acquire().await);
        assert!(vip.release().await);
        assert!(vip.check_command_permissions().is_ok());
        assert!(runner.calls().is_empty());
    }

    struct CountingHook(AtomicUsize);

    #[async_trait]
    impl CacheClearHook for CountingHook {
        async fn clear(&self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[tokio::test]
    async fn test_escalate_order() {
        let runner = Arc::new(RecordingRunner::default());
        let hook = Arc::new(CountingHook(AtomicUsize::new(0)));
        let vip = controller(
            &runner,
            VipConfig {
                escalation_command: "/etc/pgpool/escalate.sh".to_string(),
                ..config()
            },
        )
        .with_cache_hook(Arc::clone(&hook) as Arc<dyn CacheClearHook>);

        assert!(vip.escalate().await);
        assert_eq!(hook.0.load(Ordering::SeqCst), 1);

        let calls = runner.calls();
        assert_eq!(calls[0], "/bin/sh -c /etc/pgpool/escalate.sh");
        assert_eq!(calls[1], "/sbin/ip addr add 10.0.0.50/24 dev eth0");
        assert_eq!(calls[2], "/usr/sbin/arping -U 10.0.0.50 -w 1");
        assert!(calls[3].starts_with("/bin/ping"));
    }

    #[tokio::test]
    async fn test_escalate_command_failure_still_acquires() {
        let runner = Arc::new(RecordingRunner::failing(vec!["escalate.sh"]));
        let vip = controller(
            &runner,
            VipConfig {
                escalation_command: "escalate.sh".to_string(),
                clear_memqcache_on_escalation: false,
                ..config()
            },
        );

        assert!(!vip.escalate().await);
        assert!(runner.calls().iter().any(|c| c.starts_with("/sbin/ip addr add")));
    }

    #[tokio::test]
    async fn test_deescalate_spawned() {
        let runner = Arc::new(RecordingRunner::default());
        let vip = Arc::new(controller(
            &runner,
            VipConfig {
                de_escalation_command: "demote.sh".to_string(),
                ..config()
            },
        ));

        assert!(vip.spawn_deescalation().await.unwrap());
        assert_eq!(
            runner.calls(),
            vec!["/bin/sh -c demote.sh", "/sbin/ip addr del 10.0.0.50/24 dev eth0"]
        );
    }

    #[test]
    fn test_check_command_permissions() {
        let runner = Arc::new(RecordingRunner::default());

        // sh exists under /bin but is not setuid: warning only
        let ok = controller(
            &runner,
            VipConfig {
                if_up_cmd: "sh -c true".to_string(),
                if_down_cmd: "sh -c true".to_string(),
                if_cmd_path: "/bin".to_string(),
                arping_cmd: "/usr/sbin/arping".to_string(),
                ..config()
            },
        );
        assert!(ok.check_command_permissions().is_ok());

        let missing = controller(
            &runner,
            VipConfig {
                if_cmd_path: "/nonexistent".to_string(),
                ..config()
            },
        );
        assert!(missing.check_command_permissions().is_err());

        let empty = controller(
            &runner,
            VipConfig {
                if_up_cmd: " ".to_string(),
                ..config()
            },
        );
        assert!(empty.check_command_permissions().is_err());
    }
}
