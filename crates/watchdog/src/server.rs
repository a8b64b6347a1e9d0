//! Watchdog daemon wiring.

use crate::config::Config;
use crate::http_server::{AppState, MetricsServer};
use crate::lifecheck::LifeCheck;
use crate::metrics::MetricsRegistry;
use anyhow::{Context, anyhow};
use heartbeat::{HeartbeatChannel, LifeCheckRegistry};
use netmon::{LinkEvent, LinkEventMonitor, NetworkEvent};
use std::future::Future;
use std::sync::Arc;
use tokio::signal::unix::{SignalKind, signal};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use vip::{CommandRunner, ProcessRunner, TrustedServerProbe};

/// Capacity of the link event channel
const LINK_EVENT_CHANNEL_SIZE: usize = 64;

/// Watchdog daemon
pub struct WatchdogServer {
    config: Config,
}

impl WatchdogServer {
    pub fn new(config: Config) -> Self {
        Self { config }
    }

    /// Start every worker and wait for TERM, INT or QUIT.
    ///
    /// Returns as soon as a signal arrives; in-flight packets and commands
    /// are not drained. Returns an error if a heartbeat worker ends on its
    /// own, so a supervisor can restart the daemon.
    pub async fn run(self) -> anyhow::Result<()> {
        self.run_until(shutdown_signal()).await
    }

    /// Like [`run`](Self::run), stopping when `shutdown` resolves instead
    /// of on a signal.
    pub async fn run_until<F>(self, shutdown: F) -> anyhow::Result<()>
    where
        F: Future<Output = anyhow::Result<()>>,
    {
        info!(hostname = %self.config.node.hostname, "Starting watchdog");

        let cancel = CancellationToken::new();
        let runner: Arc<dyn CommandRunner> = Arc::new(ProcessRunner);

        let registry = Arc::new(LifeCheckRegistry::from_peers(
            self.config.peer_nodes(),
            self.config.heartbeat.life_point,
        ));
        let channel = HeartbeatChannel::new(self.config.heartbeat_config(), Arc::clone(&registry))
            .context("invalid heartbeat configuration")?;

        let metrics = Arc::new(MetricsRegistry::new());

        let (failed_tx, mut failed_rx) = mpsc::channel::<String>(1);
        for handle in channel.spawn(&cancel) {
            let failed_tx = failed_tx.clone();
            tokio::spawn(async move {
                let reason = match handle.await {
                    Ok(Ok(())) => return,
                    Ok(Err(e)) => {
                        error!(error = %e, "heartbeat worker terminated");
                        e.to_string()
                    }
                    Err(e) => {
                        error!(error = %e, "heartbeat worker panicked");
                        e.to_string()
                    }
                };
                let _ = failed_tx.send(reason).await;
            });
        }
        drop(failed_tx);

        if self.config.monitoring.link_events {
            self.start_link_monitor(Arc::clone(&metrics));
        }

        let lifecheck = LifeCheck::new(
            Arc::clone(&registry),
            self.config.heartbeat.deadtime,
            self.config.heartbeat.lifecheck_interval,
            self.config.trusted_servers(),
            TrustedServerProbe::new(self.config.probe_config(), Arc::clone(&runner)),
        )
        .with_metrics(Arc::clone(&metrics));
        tokio::spawn(lifecheck.run(cancel.clone()));

        if self.config.metrics.enabled {
            let state = AppState {
                metrics: Arc::clone(&metrics),
                registry: Arc::clone(&registry),
                heartbeat_stats: Arc::new(channel.stats().to_vec()),
            };
            let server = MetricsServer::new(state, self.config.metrics.listen_addr.clone());
            tokio::spawn(async move {
                if let Err(e) = server.run().await {
                    warn!(error = %e, "Metrics server error");
                }
            });
        }

        info!(
            peers = registry.len(),
            heartbeat_destinations = channel.stats().len(),
            "All tasks spawned, watchdog running"
        );

        let result = tokio::select! {
            res = shutdown => res,
            Some(reason) = failed_rx.recv() => {
                Err(anyhow!("heartbeat worker failed: {reason}"))
            }
        };
        cancel.cancel();

        match &result {
            Ok(()) => info!("Watchdog stopped"),
            Err(e) => error!(error = %e, "Watchdog stopped"),
        }
        result
    }

    fn start_link_monitor(&self, metrics: Arc<MetricsRegistry>) {
        let monitor = match LinkEventMonitor::new() {
            Ok(m) => m,
            Err(e) => {
                warn!(error = %e, "failed to create interface monitoring socket, link events disabled");
                return;
            }
        };

        let (tx, rx) = mpsc::channel(LINK_EVENT_CHANNEL_SIZE);
        if let Err(e) = monitor.spawn(tx) {
            warn!(error = %e, "failed to start link monitor thread");
            return;
        }

        tokio::spawn(handle_link_events(
            rx,
            self.config.monitoring.interfaces.clone(),
            metrics,
        ));
    }
}

/// Log link events and check the monitored interfaces when one goes away.
pub async fn handle_link_events(
    mut rx: mpsc::Receiver<LinkEvent>,
    interfaces: Vec<String>,
    metrics: Arc<MetricsRegistry>,
) {
    while let Some(event) = rx.recv().await {
        let network_event = event.network_event();
        metrics.record_link_event(network_event);
        info!(event = %network_event, "network event received");

        if matches!(
            network_event,
            NetworkEvent::LinkInactive | NetworkEvent::IpRemoved
        ) {
            match netmon::any_interface_up(&interfaces) {
                Ok(true) => {}
                Ok(false) => warn!(?interfaces, "all monitored network interfaces are down"),
                Err(e) => warn!(error = %e, "failed to query network interfaces"),
            }
        }
    }
    info!("link monitor stopped");
}

/// Wait for TERM, INT or QUIT.
async fn shutdown_signal() -> anyhow::Result<()> {
    let mut term = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    let mut int = signal(SignalKind::interrupt()).context("installing SIGINT handler")?;
    let mut quit = signal(SignalKind::quit()).context("installing SIGQUIT handler")?;

    tokio::select! {
        _ = term.recv() => info!("received SIGTERM, shutting down"),
        _ = int.recv() => info!("received SIGINT, shutting down"),
        _ = quit.recv() => info!("received SIGQUIT, shutting down"),
    }
    Ok(())
}
