//! UDP socket handling for heartbeat exchange.
//!
//! One sender socket and one receiver socket per configured interface.
//! Any failure while creating or configuring a socket is returned to the
//! caller and ends the owning worker.

use crate::packet::{HeartbeatPacket, PACKET_LEN};
use crate::types::HeartbeatInterface;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use std::io;
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::os::fd::AsRawFd;
use std::time::Duration;
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

/// Attempts made to bind the receive port.
const BIND_ATTEMPTS: u32 = 5;

/// Pause between two bind attempts.
const BIND_RETRY_DELAY: Duration = Duration::from_secs(1);

const IPTOS_LOWDELAY: libc::c_int = 0x10;

/// Heartbeat UDP socket
#[derive(Debug)]
pub struct HeartbeatSocket {
    socket: UdpSocket,
    iface: HeartbeatInterface,
}

impl HeartbeatSocket {
    /// Create the sending socket for `iface`.
    pub fn sender(iface: &HeartbeatInterface) -> io::Result<Self> {
        let socket = new_udp_socket()?;

        // Low-delay type of service
        let tos: libc::c_int = IPTOS_LOWDELAY;
        unsafe {
            if libc::setsockopt(
                socket.as_raw_fd(),
                libc::IPPROTO_IP,
                libc::IP_TOS,
                &tos as *const _ as *const libc::c_void,
                std::mem::size_of::<libc::c_int>() as libc::socklen_t,
            ) < 0
            {
                return Err(io::Error::last_os_error());
            }
        }

        bind_to_device(&socket, iface)?;
        set_reuse_port(&socket)?;
        socket.set_nonblocking(true)?;

        info!(destination = %iface, "heartbeat send socket created");

        Ok(Self {
            socket: UdpSocket::from_std(socket.into())?,
            iface: iface.clone(),
        })
    }

    /// Create the receiving socket for `iface`, bound to `INADDR_ANY:port`.
    ///
    /// Binding is retried a few times one second apart, since a previous
    /// instance may still hold the port.
    pub async fn receiver(iface: &HeartbeatInterface, port: u16) -> io::Result<Self> {
        let socket = new_udp_socket()?;

        bind_to_device(&socket, iface)?;
        socket.set_reuse_address(true)?;
        set_reuse_port(&socket)?;

        let addr = SockAddr::from(SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, port));
        let mut attempt = 1;
        loop {
            match socket.bind(&addr) {
                Ok(()) => break,
                Err(e) if attempt < BIND_ATTEMPTS => {
                    warn!(port, attempt, error = %e, "failed to bind heartbeat receive socket, retrying");
                    attempt += 1;
                    tokio::time::sleep(BIND_RETRY_DELAY).await;
                }
                Err(e) => {
                    return Err(io::Error::new(
                        e.kind(),
                        format!("failed to bind heartbeat receive socket to port {port}: {e}"),
                    ));
                }
            }
        }

        socket.set_nonblocking(true)?;

        info!(port, interface = %iface, "heartbeat receive socket created");

        Ok(Self {
            socket: UdpSocket::from_std(socket.into())?,
            iface: iface.clone(),
        })
    }

    pub fn interface(&self) -> &HeartbeatInterface {
        &self.iface
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    /// Send an (already signed) packet to `dest`.
    pub async fn send(&self, packet: &HeartbeatPacket, dest: SocketAddr) -> io::Result<usize> {
        let bytes = packet.to_bytes();
        self.socket.send_to(&bytes, dest).await
    }

    /// Receive one datagram into `buf`.
    pub async fn recv(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.socket.recv_from(buf).await
    }

    /// Buffer size large enough for any heartbeat datagram.
    pub const fn recv_buffer_len() -> usize {
        PACKET_LEN * 2
    }
}

fn new_udp_socket() -> io::Result<Socket> {
    // socket2 opens sockets with close-on-exec set
    Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
}

/// Bind to the configured device. Needs root; without it the socket is
/// left unbound and a message is logged.
fn bind_to_device(socket: &Socket, iface: &HeartbeatInterface) -> io::Result<()> {
    let Some(device) = iface.device() else {
        return Ok(());
    };

    if !nix::unistd::geteuid().is_root() {
        info!(device, "not running as root, heartbeat socket is not bound to device");
        return Ok(());
    }

    #[cfg(any(target_os = "linux", target_os = "android"))]
    {
        socket.bind_device(Some(device.as_bytes()))?;
        info!(device, "heartbeat socket bound to device");
    }

    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    {
        let _ = socket;
        info!(device, "binding to a device is not supported on this platform");
    }

    Ok(())
}

/// Enable `SO_REUSEPORT`. Kernels without it report `EINVAL` or
/// `ENOPROTOOPT`, which is tolerated.
fn set_reuse_port(socket: &Socket) -> io::Result<()> {
    match socket.set_reuse_port(true) {
        Ok(()) => Ok(()),
        Err(e) if matches!(e.raw_os_error(), Some(libc::EINVAL) | Some(libc::ENOPROTOOPT)) => {
            debug!(error = %e, "SO_REUSEPORT not supported, continuing without it");
            Ok(())
        }
        Err(e) => Err(e),
    }
}
