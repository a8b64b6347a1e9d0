//! Prometheus metrics for the watchdog daemon.

use heartbeat::{HeartbeatInterface, HeartbeatStats, NodeState, PeerSnapshot};
use netmon::NetworkEvent;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::registry::Registry;

/// Labels for heartbeat packet counters
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct HeartbeatLabels {
    /// Destination as `host:port%device`
    pub interface: String,
    /// sent, send_error, received, applied, stale, auth_failure,
    /// unknown_sender, recv_error
    pub outcome: String,
}

/// Labels for per-peer metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct PeerLabels {
    /// `host:pgpool_port`
    pub peer: String,
}

/// Labels for link event metrics
#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct LinkEventLabels {
    /// link_active, link_inactive, ip_assigned, ip_removed
    pub event: String,
}

/// Metrics registry with all watchdog metrics
pub struct MetricsRegistry {
    /// Prometheus registry
    pub registry: Registry,

    heartbeat_packets_total: Family<HeartbeatLabels, Counter>,
    peer_state: Family<PeerLabels, Gauge>,
    peer_retry_lives: Family<PeerLabels, Gauge>,
    peer_last_receipt_seconds: Family<PeerLabels, Gauge>,
    link_events_total: Family<LinkEventLabels, Counter>,
    trusted_servers_reachable: Gauge,
}

impl std::fmt::Debug for MetricsRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricsRegistry").finish_non_exhaustive()
    }
}

impl Default for MetricsRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl MetricsRegistry {
    pub fn new() -> Self {
        let mut registry = Registry::default();

        let heartbeat_packets_total = Family::<HeartbeatLabels, Counter>::default();
        registry.register(
            "watchdog_heartbeat_packets",
            "Heartbeat packets by interface and outcome",
            heartbeat_packets_total.clone(),
        );

        let peer_state = Family::<PeerLabels, Gauge>::default();
        registry.register(
            "watchdog_peer_state",
            "Peer liveness (0=empty, 1=dead, 2=alive)",
            peer_state.clone(),
        );

        let peer_retry_lives = Family::<PeerLabels, Gauge>::default();
        registry.register(
            "watchdog_peer_retry_lives",
            "Life points left before a peer is declared dead",
            peer_retry_lives.clone(),
        );

        let peer_last_receipt_seconds = Family::<PeerLabels, Gauge>::default();
        registry.register(
            "watchdog_peer_last_receipt_seconds",
            "Local time of the last applied heartbeat, seconds since the epoch",
            peer_last_receipt_seconds.clone(),
        );

        let link_events_total = Family::<LinkEventLabels, Counter>::default();
        registry.register(
            "watchdog_link_events",
            "Kernel link and address notifications",
            link_events_total.clone(),
        );

        let trusted_servers_reachable = Gauge::default();
        registry.register(
            "watchdog_trusted_servers_reachable",
            "Whether a trusted server answered the last check (1=yes, 0=no, -1=not checked)",
            trusted_servers_reachable.clone(),
        );
        trusted_servers_reachable.set(-1);

        Self {
            registry,
            heartbeat_packets_total,
            peer_state,
            peer_retry_lives,
            peer_last_receipt_seconds,
            link_events_total,
            trusted_servers_reachable,
        }
    }

    /// Bring heartbeat counters up to the workers' totals.
    pub fn sync_heartbeat(&self, iface: &HeartbeatInterface, stats: &HeartbeatStats) {
        let snap = stats.snapshot();
        let interface = iface.to_string();

        for (outcome, total) in [
            ("sent", snap.sent),
            ("send_error", snap.send_errors),
            ("received", snap.received),
            ("applied", snap.applied),
            ("stale", snap.stale),
            ("auth_failure", snap.auth_failures),
            ("unknown_sender", snap.unknown_sender),
            ("recv_error", snap.recv_errors),
        ] {
            let counter = self.heartbeat_packets_total.get_or_create(&HeartbeatLabels {
                interface: interface.clone(),
                outcome: outcome.to_string(),
            });
            let seen = counter.get();
            if total > seen {
                counter.inc_by(total - seen);
            }
        }
    }

    /// Update per-peer gauges from a registry snapshot
    pub fn update_peer(&self, peer: &PeerSnapshot) {
        let labels = PeerLabels {
            peer: peer.node.name(),
        };

        self.peer_state
            .get_or_create(&labels)
            .set(state_value(peer.state));
        self.peer_retry_lives
            .get_or_create(&labels)
            .set(i64::from(peer.retry_lives));
        self.peer_last_receipt_seconds
            .get_or_create(&labels)
            .set(i64::from(peer.recv_time.sec));
    }

    /// Record a kernel link or address notification
    pub fn record_link_event(&self, event: NetworkEvent) {
        let name = match event {
            NetworkEvent::LinkActive => "link_active",
            NetworkEvent::LinkInactive => "link_inactive",
            NetworkEvent::IpAssigned => "ip_assigned",
            NetworkEvent::IpRemoved => "ip_removed",
        };
        self.link_events_total
            .get_or_create(&LinkEventLabels {
                event: name.to_string(),
            })
            .inc();
    }

    /// Set the outcome of the last trusted server check
    pub fn set_trusted_reachable(&self, reachable: Option<bool>) {
        self.trusted_servers_reachable.set(match reachable {
            Some(true) => 1,
            Some(false) => 0,
            None => -1,
        });
    }
}

fn state_value(state: NodeState) -> i64 {
    match state {
        NodeState::Empty => 0,
        NodeState::Dead => 1,
        NodeState::Alive => 2,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use heartbeat::{HeartbeatTime, PeerNode};
    use prometheus_client::encoding::text::encode;
    use std::sync::atomic::Ordering;

    fn encoded(metrics: &MetricsRegistry) -> String {
        let mut buffer = String::new();
        encode(&mut buffer, &metrics.registry).unwrap();
        buffer
    }

    #[test]
    fn test_sync_heartbeat_is_idempotent() {
        let metrics = MetricsRegistry::new();
        let iface = HeartbeatInterface::new("node2", 9694, "eth1");
        let stats = HeartbeatStats::default();

        stats.sent.store(5, Ordering::Relaxed);
        stats.stale.store(2, Ordering::Relaxed);
        metrics.sync_heartbeat(&iface, &stats);
        metrics.sync_heartbeat(&iface, &stats);

        let text = encoded(&metrics);
        assert!(text.contains(
            r#"watchdog_heartbeat_packets_total{interface="node2:9694%eth1",outcome="sent"} 5"#
        ));
        assert!(text.contains(r#"outcome="stale"} 2"#));

        stats.sent.store(7, Ordering::Relaxed);
        metrics.sync_heartbeat(&iface, &stats);
        assert!(encoded(&metrics).contains(r#"outcome="sent"} 7"#));
    }

    #[test]
    fn test_registered_families() {
        let text = encoded(&MetricsRegistry::new());
        let mut families: Vec<&str> = text
            .lines()
            .filter_map(|line| line.strip_prefix("# TYPE "))
            .filter_map(|rest| rest.split_whitespace().next())
            .collect();
        families.sort_unstable();

        assert_eq!(
            families,
            [
                "watchdog_heartbeat_packets",
                "watchdog_link_events",
                "watchdog_peer_last_receipt_seconds",
                "watchdog_peer_retry_lives",
                "watchdog_peer_state",
                "watchdog_trusted_servers_reachable",
            ]
        );
    }

    #[test]
    fn test_peer_and_event_metrics() {
        let metrics = MetricsRegistry::new();
        metrics.update_peer(&PeerSnapshot {
            node: PeerNode::new("node2", 9000, 9999),
            send_time: HeartbeatTime::new(100, 0),
            recv_time: HeartbeatTime::new(101, 0),
            retry_lives: 3,
            state: NodeState::Alive,
        });
        metrics.record_link_event(NetworkEvent::IpRemoved);
        metrics.set_trusted_reachable(Some(false));

        let text = encoded(&metrics);
        assert!(text.contains(r#"watchdog_peer_state{peer="node2:9999"} 2"#));
        assert!(text.contains(r#"watchdog_peer_last_receipt_seconds{peer="node2:9999"} 101"#));
        assert!(text.contains(r#"watchdog_link_events_total{event="ip_removed"} 1"#));
        assert!(text.contains("watchdog_trusted_servers_reachable 0"));
    }
}
