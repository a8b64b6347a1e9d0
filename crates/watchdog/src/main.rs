//! pgpool watchdog daemon binary

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use vip::{CommandRunner, ProcessRunner, TrustedServerProbe, VipController};
use watchdog::{Config, WatchdogServer};

#[derive(Parser)]
#[command(name = "pgpool-watchdog", version, about = "pgpool cluster watchdog")]
struct Cli {
    /// Configuration file (default: search the standard locations)
    #[arg(short = 'c', long = "config", global = true)]
    config: Option<PathBuf>,

    /// Log level when RUST_LOG is unset (overrides the config file)
    #[arg(long = "log-level", global = true)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Run the watchdog (default)
    Run,
    /// Run the escalation steps and bring the delegate IP up
    Escalate,
    /// Run the de-escalation steps and bring the delegate IP down
    Deescalate,
    /// Ping hosts the way trusted servers are checked
    Probe {
        #[arg(required = true)]
        hosts: Vec<String>,
    },
    /// Check that the interface commands can be run
    CheckCommands,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    let cli = Cli::parse();

    let config = match &cli.config {
        Some(path) => Config::load_from_file(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => Config::load().context("loading configuration")?,
    };

    let level = cli
        .log_level
        .clone()
        .or_else(|| config.logging.level.clone())
        .unwrap_or_else(|| "info".to_string());
    common::logging::init_with_level(&level, config.json_logging());

    let runner: Arc<dyn CommandRunner> = Arc::new(ProcessRunner);

    match cli.command.unwrap_or(Command::Run) {
        Command::Run => {
            WatchdogServer::new(config).run().await?;
            Ok(ExitCode::SUCCESS)
        }
        Command::Escalate => {
            let controller = Arc::new(VipController::new(config.vip_config(), runner));
            let ok = controller.spawn_escalation().await.context("escalation worker")?;
            Ok(exit_code(ok))
        }
        Command::Deescalate => {
            let controller = Arc::new(VipController::new(config.vip_config(), runner));
            let ok = controller
                .spawn_deescalation()
                .await
                .context("de-escalation worker")?;
            Ok(exit_code(ok))
        }
        Command::Probe { hosts } => {
            let probe = TrustedServerProbe::new(config.probe_config(), runner);
            let mut any = false;
            for host in &hosts {
                let reachable = probe.probe_trusted(host).await;
                println!("{}: {}", host, if reachable { "reachable" } else { "unreachable" });
                any |= reachable;
            }
            Ok(exit_code(any))
        }
        Command::CheckCommands => {
            VipController::new(config.vip_config(), runner).check_command_permissions()?;
            println!("interface commands OK");
            Ok(ExitCode::SUCCESS)
        }
    }
}

fn exit_code(ok: bool) -> ExitCode {
    if ok { ExitCode::SUCCESS } else { ExitCode::FAILURE }
}
