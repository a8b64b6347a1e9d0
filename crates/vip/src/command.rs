//! External command execution.

use async_trait::async_trait;
use common::{Error, Result};
use std::os::unix::process::ExitStatusExt;
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, trace, warn};

/// How a child process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    /// Normal termination with an exit code
    Exited(i32),
    /// Killed by a signal
    Signaled(i32),
}

/// Result of running one command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandOutput {
    pub status: ExitKind,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn exited(code: i32, stdout: impl Into<String>) -> Self {
        Self {
            status: ExitKind::Exited(code),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn signaled(signal: i32) -> Self {
        Self {
            status: ExitKind::Signaled(signal),
            stdout: String::new(),
            stderr: String::new(),
        }
    }

    /// Terminated normally with status zero.
    pub fn success(&self) -> bool {
        self.status == ExitKind::Exited(0)
    }
}

/// Runs external programs.
///
/// `argv[0]` is the program to execute. Implementations wait for the
/// child without any timeout.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait CommandRunner: Send + Sync {
    async fn run(&self, argv: &[String]) -> Result<CommandOutput>;
}

/// Spawns real child processes.
#[derive(Debug, Clone, Copy, Default)]
pub struct ProcessRunner;

#[async_trait]
impl CommandRunner for ProcessRunner {
    async fn run(&self, argv: &[String]) -> Result<CommandOutput> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| Error::command("empty command line"))?;

        debug!(command = %argv.join(" "), "executing command");

        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await
            .map_err(|e| Error::command(format!("failed to execute '{}': {}", program, e)))?;

        let status = match output.status.code() {
            Some(code) => ExitKind::Exited(code),
            None => ExitKind::Signaled(output.status.signal().unwrap_or(0)),
        };

        let result = CommandOutput {
            status,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        };
        trace!(command = %program, status = ?result.status, "command finished");
        Ok(result)
    }
}

/// `argv` running `cmd` through `/bin/sh -c`, like `system(3)`.
pub fn shell(cmd: &str) -> Vec<String> {
    vec!["/bin/sh".to_string(), "-c".to_string(), cmd.to_string()]
}

/// Run `argv` and report success, logging failures against `what`.
pub(crate) async fn run_logged(runner: &dyn CommandRunner, what: &str, argv: &[String]) -> bool {
    match runner.run(argv).await {
        Ok(output) if output.success() => {
            debug!(command = what, "command succeeded");
            true
        }
        Ok(output) => {
            match output.status {
                ExitKind::Exited(code) => {
                    warn!(command = what, exit_code = code, stderr = %output.stderr.trim(), "command failed")
                }
                ExitKind::Signaled(signal) => {
                    warn!(command = what, signal, "command exited abnormally")
                }
            }
            false
        }
        Err(e) => {
            warn!(command = what, error = %e, "failed to run command");
            false
        }
    }
}
