//! Shared table of peer liveness.
//!
//! The table is sized once at startup and never grows. Receivers write
//! timestamps, the election logic reads them. Each timestamp is packed into
//! a single atomic word, so a reader never sees the seconds of one sample
//! with the microseconds of another. No lock spans a `(send_time,
//! recv_time)` pair though, and a reader racing a writer can observe a new
//! send time with an old receive time. Readers must tolerate that.

use crate::types::{HeartbeatTime, NodeState, PeerNode};
use common::{Error, Result};
use std::net::IpAddr;
use std::sync::atomic::{AtomicI32, AtomicU8, AtomicU64, Ordering};
use std::time::Duration;
use tracing::debug;

/// Index of a peer in the registry.
pub type PeerId = usize;

/// Life points a peer starts with.
pub const DEFAULT_LIFE_POINT: i32 = 3;

fn pack(t: HeartbeatTime) -> u64 {
    (u64::from(t.sec as u32) << 32) | u64::from(t.usec as u32)
}

fn unpack(word: u64) -> HeartbeatTime {
    HeartbeatTime::new((word >> 32) as u32 as i32, word as u32 as i32)
}

#[derive(Debug)]
struct Slot {
    node: PeerNode,
    send_time: AtomicU64,
    recv_time: AtomicU64,
    retry_lives: AtomicI32,
    state: AtomicU8,
}

impl Slot {
    fn new(node: PeerNode, lives: i32) -> Self {
        Self {
            node,
            send_time: AtomicU64::new(pack(HeartbeatTime::UNSET)),
            recv_time: AtomicU64::new(pack(HeartbeatTime::UNSET)),
            retry_lives: AtomicI32::new(lives),
            state: AtomicU8::new(NodeState::Empty as u8),
        }
    }

    fn send_time(&self) -> HeartbeatTime {
        unpack(self.send_time.load(Ordering::Acquire))
    }

    fn recv_time(&self) -> HeartbeatTime {
        unpack(self.recv_time.load(Ordering::Acquire))
    }
}

/// Point-in-time view of one peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerSnapshot {
    pub node: PeerNode,
    pub send_time: HeartbeatTime,
    pub recv_time: HeartbeatTime,
    pub retry_lives: i32,
    pub state: NodeState,
}

/// Result of comparing a peer's last receipt against the deadtime.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HeartbeatVerdict {
    /// Nothing recorded yet, e.g. the peer restarted and has not sent
    NotYetReceived,
    /// Last receipt within the deadtime
    Alive,
    /// Last receipt older than the deadtime
    Expired,
}

/// Fixed-capacity peer liveness table.
#[derive(Debug)]
pub struct LifeCheckRegistry {
    slots: Vec<Slot>,
    capacity: usize,
    life_point: i32,
}

impl LifeCheckRegistry {
    /// Create an empty registry holding at most `capacity` peers.
    pub fn with_capacity(capacity: usize, life_point: i32) -> Self {
        Self {
            slots: Vec::with_capacity(capacity),
            capacity,
            life_point,
        }
    }

    /// Create a registry sized to and filled with `peers`.
    pub fn from_peers(peers: impl IntoIterator<Item = PeerNode>, life_point: i32) -> Self {
        let slots: Vec<Slot> = peers
            .into_iter()
            .map(|node| Slot::new(node, life_point))
            .collect();
        let capacity = slots.len();
        Self {
            slots,
            capacity,
            life_point,
        }
    }

    /// Add a peer. Only valid during startup, before the registry is shared.
    pub fn register(&mut self, node: PeerNode) -> Result<PeerId> {
        if self.slots.len() >= self.capacity {
            return Err(Error::heartbeat(format!(
                "life check registry is full ({} peers), cannot add {}",
                self.capacity,
                node.name()
            )));
        }
        self.slots.push(Slot::new(node, self.life_point));
        Ok(self.slots.len() - 1)
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Configured identities, indexed by [`PeerId`].
    pub fn peers(&self) -> impl Iterator<Item = (PeerId, &PeerNode)> {
        self.slots.iter().map(|s| &s.node).enumerate()
    }

    pub fn node(&self, id: PeerId) -> Option<&PeerNode> {
        self.slots.get(id).map(|s| &s.node)
    }

    /// Find the peer a packet came from.
    ///
    /// The peer's configured hostname must equal the declared hostname or
    /// the datagram's source address, and the pgpool port must match.
    pub fn find(&self, from: &str, source: Option<IpAddr>, pgpool_port: i32) -> Option<PeerId> {
        let source = source.map(|ip| ip.to_string());
        self.slots.iter().position(|slot| {
            let host = slot.node.hostname.as_str();
            let host_matches = host == from || source.as_deref() == Some(host);
            host_matches && i32::from(slot.node.pgpool_port) == pgpool_port
        })
    }

    /// Store a `(send_time, recv_time)` pair. The two timestamps are
    /// written one after the other, not atomically as a pair.
    pub fn update(&self, id: PeerId, send_time: HeartbeatTime, recv_time: HeartbeatTime) {
        let Some(slot) = self.slots.get(id) else {
            debug!(peer = id, "update for unknown peer id ignored");
            return;
        };
        slot.send_time.store(pack(send_time), Ordering::Release);
        slot.recv_time.store(pack(recv_time), Ordering::Release);
    }

    /// Store the pair only if `send_time` is after the recorded one (or
    /// nothing is recorded yet). Returns whether it was stored.
    ///
    /// The send time only ever moves forward, even with several receivers
    /// racing on the same peer.
    pub fn record_if_newer(
        &self,
        id: PeerId,
        send_time: HeartbeatTime,
        recv_time: HeartbeatTime,
    ) -> bool {
        let Some(slot) = self.slots.get(id) else {
            return false;
        };
        let mut current = slot.send_time.load(Ordering::Acquire);
        loop {
            let recorded = unpack(current);
            if recorded.is_set() && recorded >= send_time {
                return false;
            }
            match slot.send_time.compare_exchange_weak(
                current,
                pack(send_time),
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        slot.recv_time.store(pack(recv_time), Ordering::Release);
        true
    }

    pub fn snapshot(&self, id: PeerId) -> Option<PeerSnapshot> {
        self.slots.get(id).map(|slot| PeerSnapshot {
            node: slot.node.clone(),
            send_time: slot.send_time(),
            recv_time: slot.recv_time(),
            retry_lives: slot.retry_lives.load(Ordering::Acquire),
            state: NodeState::from_u8(slot.state.load(Ordering::Acquire)),
        })
    }

    pub fn snapshots(&self) -> Vec<PeerSnapshot> {
        (0..self.slots.len()).filter_map(|id| self.snapshot(id)).collect()
    }

    /// Classify a peer's last receipt relative to `now`.
    pub fn check_heartbeat(
        &self,
        id: PeerId,
        now: HeartbeatTime,
        deadtime: Duration,
    ) -> Option<HeartbeatVerdict> {
        let slot = self.slots.get(id)?;
        let send = slot.send_time();
        let recv = slot.recv_time();

        if !send.is_set() || !recv.is_set() {
            debug!(peer = %slot.node.name(), "heartbeat not received yet, peer may have restarted");
            return Some(HeartbeatVerdict::NotYetReceived);
        }

        let interval = now.seconds_since(recv);
        if interval > deadtime.as_secs() as i64 {
            debug!(
                peer = %slot.node.name(),
                interval,
                deadtime = deadtime.as_secs(),
                "no heartbeat within deadtime"
            );
            Some(HeartbeatVerdict::Expired)
        } else {
            Some(HeartbeatVerdict::Alive)
        }
    }

    /// Restore a peer's life points after a successful check.
    pub fn reset_lives(&self, id: PeerId) {
        if let Some(slot) = self.slots.get(id) {
            slot.retry_lives.store(self.life_point, Ordering::Release);
        }
    }

    /// Take one life point after a failed check; returns what is left.
    pub fn consume_life(&self, id: PeerId) -> Option<i32> {
        let slot = self.slots.get(id)?;
        Some(slot.retry_lives.fetch_sub(1, Ordering::AcqRel) - 1)
    }

    pub fn set_state(&self, id: PeerId, state: NodeState) {
        if let Some(slot) = self.slots.get(id) {
            slot.state.store(state as u8, Ordering::Release);
        }
    }

    pub fn state(&self, id: PeerId) -> Option<NodeState> {
        self.slots
            .get(id)
            .map(|slot| NodeState::from_u8(slot.state.load(Ordering::Acquire)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn registry() -> LifeCheckRegistry {
        LifeCheckRegistry::from_peers(
            [
                PeerNode::new("node1", 9000, 9999),
                PeerNode::new("10.0.0.2", 9000, 9999),
                PeerNode::new("node1", 9001, 9998),
            ],
            DEFAULT_LIFE_POINT,
        )
    }

    #[test]
    fn test_register_respects_capacity() {
        let mut reg = LifeCheckRegistry::with_capacity(1, 3);
        assert_eq!(reg.register(PeerNode::new("a", 1, 2)).unwrap(), 0);
        assert!(reg.register(PeerNode::new("b", 1, 2)).is_err());
        assert_eq!(reg.len(), 1);
        assert_eq!(reg.capacity(), 1);
    }

    #[test]
    fn test_find_by_hostname_or_source() {
        let reg = registry();
        assert_eq!(reg.find("node1", None, 9999), Some(0));
        assert_eq!(reg.find("node1", None, 9998), Some(2));
        assert_eq!(reg.find("node1", None, 1234), None);

        // declared name unknown, source address matches the configured one
        let src: IpAddr = "10.0.0.2".parse().unwrap();
        assert_eq!(reg.find("other-name", Some(src), 9999), Some(1));
        assert_eq!(reg.find("other-name", None, 9999), None);
    }

    #[test]
    fn test_record_if_newer() {
        let reg = registry();
        let t1 = HeartbeatTime::new(100, 0);
        let t2 = HeartbeatTime::new(100, 1);
        let recv = HeartbeatTime::new(200, 0);

        assert!(reg.record_if_newer(0, t2, recv));
        assert!(!reg.record_if_newer(0, t1, HeartbeatTime::new(201, 0)));
        assert!(!reg.record_if_newer(0, t2, HeartbeatTime::new(202, 0)));

        let snap = reg.snapshot(0).unwrap();
        assert_eq!(snap.send_time, t2);
        assert_eq!(snap.recv_time, recv);
    }

    #[test]
    fn test_record_if_newer_never_moves_backwards() {
        use std::sync::Arc;
        use std::thread;

        let reg = Arc::new(registry());
        let workers: Vec<_> = (0..4)
            .map(|offset| {
                let reg = Arc::clone(&reg);
                thread::spawn(move || {
                    let mut last_seen = HeartbeatTime::UNSET;
                    for round in 0..2000 {
                        let t = HeartbeatTime::new(1000 + round, offset);
                        reg.record_if_newer(0, t, t);
                        let seen = reg.snapshot(0).unwrap().send_time;
                        assert!(seen >= last_seen, "send time went from {last_seen} to {seen}");
                        last_seen = seen;
                    }
                })
            })
            .collect();
        for worker in workers {
            worker.join().unwrap();
        }

        assert_eq!(reg.snapshot(0).unwrap().send_time, HeartbeatTime::new(2999, 3));
    }

    #[test]
    fn test_timestamps_round_trip_through_packing() {
        for t in [
            HeartbeatTime::UNSET,
            HeartbeatTime::new(1_700_000_000, 999_999),
            HeartbeatTime::new(-5, 7),
            HeartbeatTime::new(i32::MAX, i32::MAX),
        ] {
            assert_eq!(unpack(pack(t)), t);
        }
    }

    #[test]
    fn test_check_heartbeat() {
        let reg = registry();
        let deadtime = Duration::from_secs(30);
        let now = HeartbeatTime::new(1000, 0);

        assert_eq!(reg.check_heartbeat(0, now, deadtime), Some(HeartbeatVerdict::NotYetReceived));

        reg.update(0, HeartbeatTime::new(980, 0), HeartbeatTime::new(980, 0));
        assert_eq!(reg.check_heartbeat(0, now, deadtime), Some(HeartbeatVerdict::Alive));

        reg.update(0, HeartbeatTime::new(960, 0), HeartbeatTime::new(969, 0));
        assert_eq!(reg.check_heartbeat(0, now, deadtime), Some(HeartbeatVerdict::Expired));

        assert_eq!(reg.check_heartbeat(42, now, deadtime), None);
    }

    #[test]
    fn test_lives_and_state() {
        let reg = registry();
        assert_eq!(reg.consume_life(1), Some(2));
        assert_eq!(reg.consume_life(1), Some(1));
        reg.reset_lives(1);
        assert_eq!(reg.snapshot(1).unwrap().retry_lives, DEFAULT_LIFE_POINT);

        assert_eq!(reg.state(1), Some(NodeState::Empty));
        reg.set_state(1, NodeState::Alive);
        assert_eq!(reg.state(1), Some(NodeState::Alive));
        assert_eq!(reg.snapshot(1).unwrap().state, NodeState::Alive);
    }

    #[test]
    fn test_unknown_id_is_harmless() {
        let reg = registry();
        reg.update(99, HeartbeatTime::new(1, 0), HeartbeatTime::new(1, 0));
        assert!(!reg.record_if_newer(99, HeartbeatTime::new(1, 0), HeartbeatTime::new(1, 0)));
        assert!(reg.snapshot(99).is_none());
        assert_eq!(reg.snapshots().len(), 3);
    }
}
