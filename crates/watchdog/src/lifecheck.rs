//! Periodic peer liveness evaluation over the heartbeat registry.
//!
//! Turns heartbeat receipts into `ALIVE`/`DEAD` classifications using the
//! peer's life points. Trusted servers are checked first on every pass;
//! while none of them answers the local network is suspect and peers are
//! left as they are. What to do about either is left to the election logic
//! reading the registry.

use crate::metrics::MetricsRegistry;
use heartbeat::{HeartbeatTime, HeartbeatVerdict, LifeCheckRegistry, NodeState};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};
use vip::{TrustedServerProbe, TrustedServers};

/// Result of one pass over the registry.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LifeCheckSummary {
    pub alive: usize,
    pub dead: usize,
    pub pending: usize,
    /// Outcome of the trusted server check, when one ran
    pub trusted_reachable: Option<bool>,
}

/// Periodic liveness evaluation.
pub struct LifeCheck {
    registry: Arc<LifeCheckRegistry>,
    deadtime: Duration,
    interval: Duration,
    trusted: TrustedServers,
    probe: TrustedServerProbe,
    metrics: Option<Arc<MetricsRegistry>>,
}

impl LifeCheck {
    pub fn new(
        registry: Arc<LifeCheckRegistry>,
        deadtime: Duration,
        interval: Duration,
        trusted: TrustedServers,
        probe: TrustedServerProbe,
    ) -> Self {
        Self {
            registry,
            deadtime,
            interval,
            trusted,
            probe,
            metrics: None,
        }
    }

    pub fn with_metrics(mut self, metrics: Arc<MetricsRegistry>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Classify every peer once at `now`.
    pub async fn check_peers(&self, now: HeartbeatTime) -> LifeCheckSummary {
        let mut summary = LifeCheckSummary::default();

        if !self.trusted.is_empty() {
            summary.trusted_reachable = self.check_trusted().await;
            if summary.trusted_reachable == Some(false) {
                return summary;
            }
        }

        for (id, node) in self.registry.peers() {
            match self.registry.check_heartbeat(id, now, self.deadtime) {
                Some(HeartbeatVerdict::Alive) => {
                    self.registry.reset_lives(id);
                    if self.registry.state(id) != Some(NodeState::Alive) {
                        info!(peer = %node.name(), "heartbeat from peer received, peer is alive");
                        self.registry.set_state(id, NodeState::Alive);
                    }
                    summary.alive += 1;
                }
                Some(HeartbeatVerdict::Expired) => {
                    if self.registry.state(id) == Some(NodeState::Dead) {
                        summary.dead += 1;
                        continue;
                    }
                    let lives = self.registry.consume_life(id).unwrap_or(0);
                    if lives <= 0 {
                        warn!(peer = %node.name(), "lifecheck failed, no heartbeat signal from peer");
                        self.registry.set_state(id, NodeState::Dead);
                        summary.dead += 1;
                    } else {
                        info!(peer = %node.name(), lives, "no heartbeat within deadtime");
                        summary.alive += 1;
                    }
                }
                Some(HeartbeatVerdict::NotYetReceived) | None => summary.pending += 1,
            }
        }

        if let Some(metrics) = &self.metrics {
            for peer in self.registry.snapshots() {
                metrics.update_peer(&peer);
            }
        }

        summary
    }

    async fn check_trusted(&self) -> Option<bool> {
        let reachable = self.trusted.any_reachable(&self.probe).await;
        match reachable {
            Some(true) => debug!("trusted server reachable, local network is up"),
            Some(false) => warn!("failed to connect to any trusted servers, local network may be down"),
            None => debug!("no trusted servers configured"),
        }
        if let Some(metrics) = &self.metrics {
            metrics.set_trusted_reachable(reachable);
        }
        reachable
    }

    /// Check peers every `interval` until cancelled.
    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    let summary = self.check_peers(HeartbeatTime::now()).await;
                    debug!(?summary, "lifecheck pass");
                }
            }
        }
    }
}
