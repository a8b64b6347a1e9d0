//! Watchdog heartbeat
//!
//! Authenticated, timestamped UDP liveness packets exchanged between the
//! nodes of a pgpool cluster, and the shared table recording when each
//! peer was last heard.
//!
//! # Features
//!
//! - Fixed-layout heartbeat packet in network byte order
//! - Keyed MD5 and HMAC-SHA256 packet authentication
//! - One sender and one receiver per configured interface
//! - Out-of-order and duplicate packets never move a peer's clock back
//! - Lock-free liveness registry readable by the election logic
//!
//! # Example
//!
//! ```no_run
//! use heartbeat::{HeartbeatChannel, HeartbeatConfig, HeartbeatInterface, LifeCheckRegistry, PeerNode};
//! use std::sync::Arc;
//! use tokio_util::sync::CancellationToken;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let mut config = HeartbeatConfig::default();
//! config.hostname = "node1".to_string();
//! config.auth_key = "secret".to_string();
//! config.interfaces.push(HeartbeatInterface::new("node2", 9694, "eth1"));
//!
//! let registry = Arc::new(LifeCheckRegistry::from_peers([PeerNode::new("node2", 9000, 9999)], 3));
//! let channel = HeartbeatChannel::new(config, registry)?;
//!
//! let cancel = CancellationToken::new();
//! for handle in channel.spawn(&cancel) {
//!     handle.await??;
//! }
//! # Ok(())
//! # }
//! ```

mod auth;
mod channel;
mod packet;
mod registry;
mod socket;
mod types;

pub use auth::PacketAuthenticator;
pub use channel::{HeartbeatChannel, HeartbeatReceiver, HeartbeatSender, ReceiveOutcome};
pub use packet::{HeartbeatPacket, PACKET_LEN};
pub use registry::{DEFAULT_LIFE_POINT, HeartbeatVerdict, LifeCheckRegistry, PeerId, PeerSnapshot};
pub use socket::HeartbeatSocket;
pub use types::{
    AuthMethod, DEFAULT_DEADTIME, DEFAULT_HEARTBEAT_PORT, DEFAULT_KEEPALIVE, HeartbeatConfig,
    HeartbeatInterface, HeartbeatStats, HeartbeatStatsSnapshot, HeartbeatTime, NodeState,
    PeerNode,
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_basic_types() {
        let config = HeartbeatConfig::default();
        assert_eq!(config.bind_port, DEFAULT_HEARTBEAT_PORT);
        assert!(config.validate().is_ok());

        assert_eq!(NodeState::Alive.to_string(), "ALIVE");
    }
}
