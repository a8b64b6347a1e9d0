//! Linux netlink route socket.

use crate::event::{LinkEvent, LinkEventSource, decode_netlink_messages};
use common::{Error, Result};
use netlink_sys::{Socket, SocketAddr, protocols::NETLINK_ROUTE};
use tracing::{debug, trace};

/// Multicast groups for link and IPv4 address changes.
const LINK_AND_ADDR_GROUPS: u32 = (libc::RTMGRP_LINK | libc::RTMGRP_IPV4_IFADDR) as u32;

const RECV_BUFFER_LEN: usize = 4096;

/// Netlink socket subscribed to link and IPv4 address notifications.
pub struct NetlinkMonitor {
    socket: Socket,
    buf: Vec<u8>,
}

impl NetlinkMonitor {
    /// Create the socket and join the link and IPv4 address groups.
    pub fn new() -> Result<Self> {
        debug!("Creating netlink route socket for interface monitoring");

        let mut socket = Socket::new(NETLINK_ROUTE)
            .map_err(|e| Error::netlink(format!("Failed to create netlink socket: {}", e)))?;

        let addr = SocketAddr::new(0, LINK_AND_ADDR_GROUPS);
        socket
            .bind(&addr)
            .map_err(|e| Error::netlink(format!("Failed to bind netlink socket: {}", e)))?;

        Ok(Self {
            socket,
            buf: Vec::with_capacity(RECV_BUFFER_LEN),
        })
    }
}

impl LinkEventSource for NetlinkMonitor {
    fn read_event(&mut self) -> Result<Option<LinkEvent>> {
        self.buf.clear();
        let len = self
            .socket
            .recv(&mut self.buf, 0)
            .map_err(|e| Error::netlink(format!("Failed to receive netlink message: {}", e)))?;

        let event = decode_netlink_messages(&self.buf[..len.min(self.buf.len())]);
        trace!(len, ?event, "netlink message received");
        Ok(event)
    }
}
