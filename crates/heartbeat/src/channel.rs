//! Heartbeat sender and receiver workers.
//!
//! Each configured interface gets one sender and one receiver. Both loop
//! until cancelled. Socket setup errors end the worker with an error;
//! errors on a single packet are logged and the loop goes on.

use crate::auth::PacketAuthenticator;
use crate::packet::HeartbeatPacket;
use crate::registry::{LifeCheckRegistry, PeerId};
use crate::socket::HeartbeatSocket;
use crate::types::{HeartbeatConfig, HeartbeatInterface, HeartbeatStats, HeartbeatTime};
use common::{Error, Result};
use std::io;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio::time::{MissedTickBehavior, interval};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// What the receiver did with one datagram.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReceiveOutcome {
    /// Peer state updated
    Applied(PeerId),
    /// Not newer than what is recorded for the peer
    Stale(PeerId),
    /// Authentication hash mismatch
    AuthFailed,
    /// No configured peer matches the sender
    UnknownSender,
    /// Datagram is not a heartbeat packet
    Malformed,
}

/// Periodically sends heartbeat packets to one destination.
#[derive(Debug)]
pub struct HeartbeatSender {
    config: Arc<HeartbeatConfig>,
    iface: HeartbeatInterface,
    auth: PacketAuthenticator,
    stats: Arc<HeartbeatStats>,
}

impl HeartbeatSender {
    pub fn new(
        config: Arc<HeartbeatConfig>,
        iface: HeartbeatInterface,
        auth: PacketAuthenticator,
        stats: Arc<HeartbeatStats>,
    ) -> Self {
        Self {
            config,
            iface,
            auth,
            stats,
        }
    }

    /// Build and sign the packet sent at `now`.
    pub fn build_packet(&self, now: HeartbeatTime) -> HeartbeatPacket {
        let mut packet =
            HeartbeatPacket::new(&self.config.hostname, i32::from(self.config.pgpool_port), now);
        packet.sign(&self.auth);
        packet
    }

    /// Send every keepalive interval until cancelled.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let socket = HeartbeatSocket::sender(&self.iface).map_err(|e| {
            Error::heartbeat(format!(
                "failed to create heartbeat send socket for {}: {}",
                self.iface, e
            ))
        })?;

        info!(
            destination = %self.iface,
            keepalive_ms = self.config.keepalive.as_millis() as u64,
            "heartbeat sender started"
        );

        let mut ticker = interval(self.config.keepalive);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(destination = %self.iface, "heartbeat sender stopped");
                    return Ok(());
                }
                _ = ticker.tick() => {
                    self.send_once(&socket).await;
                }
            }
        }
    }

    async fn send_once(&self, socket: &HeartbeatSocket) {
        // resolved on every send so DNS changes are picked up
        let Some(dest) = resolve_ipv4(&self.iface.hostname, self.iface.port).await else {
            warn!(host = %self.iface.hostname, "could not resolve heartbeat destination");
            HeartbeatStats::incr(&self.stats.send_errors);
            return;
        };

        let packet = self.build_packet(HeartbeatTime::now());
        match socket.send(&packet, dest).await {
            Ok(_) => {
                HeartbeatStats::incr(&self.stats.sent);
                debug!(destination = %dest, time = %packet.send_time, "heartbeat sent");
            }
            Err(e) => {
                HeartbeatStats::incr(&self.stats.send_errors);
                warn!(destination = %dest, error = %e, "failed to send heartbeat");
            }
        }
    }
}

/// Receives heartbeat packets and records them in the registry.
#[derive(Debug)]
pub struct HeartbeatReceiver {
    iface: HeartbeatInterface,
    bind_port: u16,
    registry: Arc<LifeCheckRegistry>,
    auth: PacketAuthenticator,
    stats: Arc<HeartbeatStats>,
}

impl HeartbeatReceiver {
    pub fn new(
        iface: HeartbeatInterface,
        bind_port: u16,
        registry: Arc<LifeCheckRegistry>,
        auth: PacketAuthenticator,
        stats: Arc<HeartbeatStats>,
    ) -> Self {
        Self {
            iface,
            bind_port,
            registry,
            auth,
            stats,
        }
    }

    /// Handle one datagram received at `now` from `source`.
    pub fn process_datagram(
        &self,
        data: &[u8],
        source: Option<IpAddr>,
        now: HeartbeatTime,
    ) -> ReceiveOutcome {
        HeartbeatStats::incr(&self.stats.received);

        let packet = match HeartbeatPacket::parse(data) {
            Ok(p) => p,
            Err(e) => {
                HeartbeatStats::incr(&self.stats.recv_errors);
                warn!(source = ?source, error = e, "failed to decode heartbeat packet");
                return ReceiveOutcome::Malformed;
            }
        };

        if !packet.verify(&self.auth) {
            HeartbeatStats::incr(&self.stats.auth_failures);
            warn!(
                from = %packet.from,
                source = ?source,
                "authentication failed for heartbeat packet"
            );
            return ReceiveOutcome::AuthFailed;
        }

        let Some(id) = self
            .registry
            .find(&packet.from, source, packet.from_pgpool_port)
        else {
            HeartbeatStats::incr(&self.stats.unknown_sender);
            debug!(
                from = %packet.from,
                port = packet.from_pgpool_port,
                "heartbeat from unknown node ignored"
            );
            return ReceiveOutcome::UnknownSender;
        };

        if self.registry.record_if_newer(id, packet.send_time, now) {
            HeartbeatStats::incr(&self.stats.applied);
            debug!(
                from = %packet.from,
                port = packet.from_pgpool_port,
                send_time = %packet.send_time,
                "heartbeat received"
            );
            ReceiveOutcome::Applied(id)
        } else {
            HeartbeatStats::incr(&self.stats.stale);
            debug!(
                from = %packet.from,
                send_time = %packet.send_time,
                "received heartbeat signal is older than the latest, ignored"
            );
            ReceiveOutcome::Stale(id)
        }
    }

    /// Handle the result of one `recvfrom`. A failed receive is counted
    /// and logged; the caller keeps receiving either way.
    pub fn handle_recv(
        &self,
        result: io::Result<(usize, SocketAddr)>,
        buf: &[u8],
        now: HeartbeatTime,
    ) -> Option<ReceiveOutcome> {
        match result {
            Ok((len, src)) => Some(self.process_datagram(&buf[..len], Some(src.ip()), now)),
            Err(e) => {
                HeartbeatStats::incr(&self.stats.recv_errors);
                warn!(interface = %self.iface, error = %e, "failed to receive heartbeat");
                None
            }
        }
    }

    /// Receive until cancelled.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let socket = HeartbeatSocket::receiver(&self.iface, self.bind_port)
            .await
            .map_err(|e| {
                Error::heartbeat(format!(
                    "failed to create heartbeat receive socket for {}: {}",
                    self.iface, e
                ))
            })?;
        self.run_on(socket, cancel).await
    }

    /// Receive on an already created socket until cancelled.
    pub async fn run_on(self, socket: HeartbeatSocket, cancel: CancellationToken) -> Result<()> {
        info!(interface = %self.iface, port = self.bind_port, "heartbeat receiver started");

        let mut buf = vec![0u8; HeartbeatSocket::recv_buffer_len()];
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!(interface = %self.iface, "heartbeat receiver stopped");
                    return Ok(());
                }
                result = socket.recv(&mut buf) => {
                    self.handle_recv(result, &buf, HeartbeatTime::now());
                }
            }
        }
    }
}

/// All heartbeat workers of this node: a sender and a receiver for every
/// configured interface.
#[derive(Debug)]
pub struct HeartbeatChannel {
    config: Arc<HeartbeatConfig>,
    registry: Arc<LifeCheckRegistry>,
    auth: PacketAuthenticator,
    stats: Vec<(HeartbeatInterface, Arc<HeartbeatStats>)>,
}

impl HeartbeatChannel {
    pub fn new(config: HeartbeatConfig, registry: Arc<LifeCheckRegistry>) -> Result<Self> {
        config.validate().map_err(Error::config)?;

        let auth = PacketAuthenticator::new(config.auth_key.as_bytes(), config.auth_method);
        let stats = config
            .interfaces
            .iter()
            .map(|iface| (iface.clone(), Arc::new(HeartbeatStats::default())))
            .collect();

        Ok(Self {
            config: Arc::new(config),
            registry,
            auth,
            stats,
        })
    }

    pub fn registry(&self) -> &Arc<LifeCheckRegistry> {
        &self.registry
    }

    /// Counters per interface.
    pub fn stats(&self) -> &[(HeartbeatInterface, Arc<HeartbeatStats>)] {
        &self.stats
    }

    /// Spawn every worker. Each handle resolves when its worker ends.
    pub fn spawn(&self, cancel: &CancellationToken) -> Vec<JoinHandle<Result<()>>> {
        let mut handles = Vec::with_capacity(self.stats.len() * 2);

        for (iface, stats) in &self.stats {
            let receiver = HeartbeatReceiver::new(
                iface.clone(),
                self.config.bind_port,
                Arc::clone(&self.registry),
                self.auth.clone(),
                Arc::clone(stats),
            );
            handles.push(tokio::spawn(receiver.run(cancel.child_token())));

            let sender = HeartbeatSender::new(
                Arc::clone(&self.config),
                iface.clone(),
                self.auth.clone(),
                Arc::clone(stats),
            );
            handles.push(tokio::spawn(sender.run(cancel.child_token())));
        }

        handles
    }
}

async fn resolve_ipv4(host: &str, port: u16) -> Option<SocketAddr> {
    match tokio::net::lookup_host((host, port)).await {
        Ok(mut addrs) => addrs.find(SocketAddr::is_ipv4),
        Err(e) => {
            debug!(host, error = %e, "host lookup failed");
            None
        }
    }
}
