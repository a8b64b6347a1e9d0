//! BSD routing socket.

use crate::event::{LinkEvent, LinkEventSource, decode_route_message};
use common::{Error, Result};
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};
use tracing::{debug, trace};

const RECV_BUFFER_LEN: usize = 1024;

/// Raw routing socket receiving every address family.
pub struct RouteSocketMonitor {
    fd: OwnedFd,
    buf: [u8; RECV_BUFFER_LEN],
}

impl RouteSocketMonitor {
    pub fn new() -> Result<Self> {
        debug!("Creating routing socket for interface monitoring");

        let fd = unsafe { libc::socket(libc::PF_ROUTE, libc::SOCK_RAW, libc::AF_UNSPEC) };
        if fd < 0 {
            return Err(Error::netlink(format!(
                "Failed to create routing socket: {}",
                io::Error::last_os_error()
            )));
        }

        Ok(Self {
            fd: unsafe { OwnedFd::from_raw_fd(fd) },
            buf: [0u8; RECV_BUFFER_LEN],
        })
    }
}

impl LinkEventSource for RouteSocketMonitor {
    fn read_event(&mut self) -> Result<Option<LinkEvent>> {
        let len = loop {
            let n = unsafe {
                libc::recv(
                    self.fd.as_raw_fd(),
                    self.buf.as_mut_ptr() as *mut libc::c_void,
                    self.buf.len(),
                    0,
                )
            };
            if n >= 0 {
                break n as usize;
            }
            let err = io::Error::last_os_error();
            if err.kind() != io::ErrorKind::Interrupted {
                return Err(Error::netlink(format!(
                    "Failed to receive routing message: {}",
                    err
                )));
            }
        };

        let event = decode_route_message(&self.buf[..len]);
        trace!(len, ?event, "routing message received");
        Ok(event)
    }
}
