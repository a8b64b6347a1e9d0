//! Heartbeat data types and configuration.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

/// Width of the NUL padded hostname field on the wire.
pub const HOSTNAME_FIELD_LEN: usize = 256;

/// Width of the NUL padded hash field on the wire (64 hex chars + NUL).
pub const HASH_FIELD_LEN: usize = 65;

/// Default UDP port heartbeat receivers bind to.
pub const DEFAULT_HEARTBEAT_PORT: u16 = 9694;

/// Default keepalive interval between two heartbeat sends.
pub const DEFAULT_KEEPALIVE: Duration = Duration::from_secs(2);

/// Default time without heartbeat after which a peer is considered gone.
pub const DEFAULT_DEADTIME: Duration = Duration::from_secs(30);

/// Wall-clock timestamp carried by heartbeat packets (seconds + microseconds).
///
/// Ordering is lexicographic on `(sec, usec)`; the all-zero value means
/// "never set".
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct HeartbeatTime {
    pub sec: i32,
    pub usec: i32,
}

impl HeartbeatTime {
    pub const UNSET: HeartbeatTime = HeartbeatTime { sec: 0, usec: 0 };

    pub fn new(sec: i32, usec: i32) -> Self {
        Self { sec, usec }
    }

    /// Current wall-clock time.
    pub fn now() -> Self {
        Self::from(SystemTime::now())
    }

    pub fn is_set(&self) -> bool {
        self.sec != 0 || self.usec != 0
    }

    /// Whole seconds elapsed from `earlier` to `self`, rounded to nearest.
    pub fn seconds_since(&self, earlier: HeartbeatTime) -> i64 {
        let micros = (self.sec as i64 - earlier.sec as i64) * 1_000_000
            + (self.usec as i64 - earlier.usec as i64);
        (micros + 500_000).div_euclid(1_000_000)
    }
}

impl From<SystemTime> for HeartbeatTime {
    fn from(t: SystemTime) -> Self {
        let since = t.duration_since(UNIX_EPOCH).unwrap_or_default();
        Self {
            sec: since.as_secs() as i32,
            usec: since.subsec_micros() as i32,
        }
    }
}

impl fmt::Display for HeartbeatTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{:06}", self.sec, self.usec)
    }
}

/// Liveness classification of a peer as kept in the shared table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum NodeState {
    #[default]
    Empty = 0,
    Dead = 1,
    Alive = 2,
}

impl NodeState {
    pub(crate) fn from_u8(v: u8) -> Self {
        match v {
            1 => NodeState::Dead,
            2 => NodeState::Alive,
            _ => NodeState::Empty,
        }
    }
}

impl fmt::Display for NodeState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NodeState::Empty => write!(f, "EMPTY"),
            NodeState::Dead => write!(f, "DEAD"),
            NodeState::Alive => write!(f, "ALIVE"),
        }
    }
}

/// Identity of a cluster member as configured at startup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerNode {
    /// Host name (or address) the peer announces itself with
    pub hostname: String,

    /// Watchdog port of the peer
    pub wd_port: u16,

    /// pgpool port of the peer, used to disambiguate nodes on one host
    pub pgpool_port: u16,
}

impl PeerNode {
    pub fn new(hostname: impl Into<String>, wd_port: u16, pgpool_port: u16) -> Self {
        Self {
            hostname: hostname.into(),
            wd_port,
            pgpool_port,
        }
    }

    /// `host:pgpool_port`, as used in log lines.
    pub fn name(&self) -> String {
        format!("{}:{}", self.hostname, self.pgpool_port)
    }
}

/// Keyed hash construction used for heartbeat authentication.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AuthMethod {
    /// Two-stage keyed MD5 (key halves as user/password salt)
    Md5,
    /// HMAC-SHA256 over the payload with the shared key
    #[default]
    HmacSha256,
}

/// One heartbeat destination: where the sender transmits and which device
/// both workers of the pair bind to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeartbeatInterface {
    /// Destination host name or address (`heartbeat_hostname[n]`)
    pub hostname: String,

    /// Destination UDP port (`heartbeat_port[n]`)
    pub port: u16,

    /// Network device to bind to, empty for none (`heartbeat_device[n]`)
    pub device: String,
}

impl HeartbeatInterface {
    pub fn new(hostname: impl Into<String>, port: u16, device: impl Into<String>) -> Self {
        Self {
            hostname: hostname.into(),
            port,
            device: device.into(),
        }
    }

    pub fn device(&self) -> Option<&str> {
        if self.device.is_empty() {
            None
        } else {
            Some(&self.device)
        }
    }
}

impl fmt::Display for HeartbeatInterface {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.device() {
            Some(dev) => write!(f, "{}:{}%{}", self.hostname, self.port, dev),
            None => write!(f, "{}:{}", self.hostname, self.port),
        }
    }
}

/// Heartbeat configuration, shared read-only by every worker.
#[derive(Debug, Clone)]
pub struct HeartbeatConfig {
    /// Host name this node puts in the `from` field
    pub hostname: String,

    /// pgpool port this node puts in the packet
    pub pgpool_port: u16,

    /// Local UDP port receivers bind to (`wd_heartbeat_port`)
    pub bind_port: u16,

    /// Interval between sends (`wd_heartbeat_keepalive`)
    pub keepalive: Duration,

    /// Silence after which a peer is reported expired (`wd_heartbeat_deadtime`)
    pub deadtime: Duration,

    /// Shared authentication key; empty disables authentication
    pub auth_key: String,

    /// Hash construction for authentication
    pub auth_method: AuthMethod,

    /// One sender/receiver pair per entry
    pub interfaces: Vec<HeartbeatInterface>,
}

impl Default for HeartbeatConfig {
    fn default() -> Self {
        Self {
            hostname: String::from("localhost"),
            pgpool_port: 9999,
            bind_port: DEFAULT_HEARTBEAT_PORT,
            keepalive: DEFAULT_KEEPALIVE,
            deadtime: DEFAULT_DEADTIME,
            auth_key: String::new(),
            auth_method: AuthMethod::default(),
            interfaces: Vec::new(),
        }
    }
}

impl HeartbeatConfig {
    /// Validate configuration
    pub fn validate(&self) -> Result<(), String> {
        if self.hostname.is_empty() {
            return Err("Local hostname is required".to_string());
        }

        if self.hostname.len() >= HOSTNAME_FIELD_LEN {
            return Err(format!(
                "Local hostname must be shorter than {} bytes",
                HOSTNAME_FIELD_LEN
            ));
        }

        if self.keepalive.is_zero() {
            return Err("Keepalive interval must be positive".to_string());
        }

        if self.deadtime <= self.keepalive {
            return Err("Deadtime must be longer than the keepalive interval".to_string());
        }

        for iface in &self.interfaces {
            if iface.hostname.is_empty() {
                return Err("Heartbeat destination hostname is required".to_string());
            }
            if iface.port == 0 {
                return Err(format!("Heartbeat destination {} has no port", iface.hostname));
            }
        }

        Ok(())
    }
}

/// Heartbeat worker statistics.
///
/// Counters are plain atomics so sender and receiver tasks can update them
/// without coordination.
#[derive(Debug, Default)]
pub struct HeartbeatStats {
    /// Packets sent
    pub sent: AtomicU64,

    /// Failed sends (resolution or sendto)
    pub send_errors: AtomicU64,

    /// Datagrams received
    pub received: AtomicU64,

    /// Packets applied to the registry
    pub applied: AtomicU64,

    /// Packets discarded as not newer than the recorded one
    pub stale: AtomicU64,

    /// Packets rejected by authentication
    pub auth_failures: AtomicU64,

    /// Packets from a sender matching no configured peer
    pub unknown_sender: AtomicU64,

    /// Failed receives or undecodable datagrams
    pub recv_errors: AtomicU64,
}

impl HeartbeatStats {
    pub(crate) fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Point-in-time copy of every counter.
    pub fn snapshot(&self) -> HeartbeatStatsSnapshot {
        HeartbeatStatsSnapshot {
            sent: self.sent.load(Ordering::Relaxed),
            send_errors: self.send_errors.load(Ordering::Relaxed),
            received: self.received.load(Ordering::Relaxed),
            applied: self.applied.load(Ordering::Relaxed),
            stale: self.stale.load(Ordering::Relaxed),
            auth_failures: self.auth_failures.load(Ordering::Relaxed),
            unknown_sender: self.unknown_sender.load(Ordering::Relaxed),
            recv_errors: self.recv_errors.load(Ordering::Relaxed),
        }
    }
}

/// Plain copy of [`HeartbeatStats`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HeartbeatStatsSnapshot {
    pub sent: u64,
    pub send_errors: u64,
    pub received: u64,
    pub applied: u64,
    pub stale: u64,
    pub auth_failures: u64,
    pub unknown_sender: u64,
    pub recv_errors: u64,
}
