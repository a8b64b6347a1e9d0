//! Background reader forwarding link events to async consumers.

use crate::event::{LinkEvent, LinkEventSource};
use common::Result;
use std::io;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Pause after a failed read before reading again.
const READ_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Owns a link event source and reads it on a dedicated thread.
pub struct LinkEventMonitor {
    source: Box<dyn LinkEventSource + Send>,
}

impl LinkEventMonitor {
    /// Monitor the platform's routing socket.
    pub fn new() -> Result<Self> {
        Ok(Self::with_source(create_socket()?))
    }

    pub fn with_source(source: Box<dyn LinkEventSource + Send>) -> Self {
        Self { source }
    }

    /// Read one event, blocking.
    pub fn read_event(&mut self) -> Result<Option<LinkEvent>> {
        self.source.read_event()
    }

    /// Read on a new thread and send every decoded event to `tx`.
    ///
    /// The thread ends once the receiving side is dropped and another
    /// event arrives.
    pub fn spawn(mut self, tx: mpsc::Sender<LinkEvent>) -> io::Result<JoinHandle<()>> {
        thread::Builder::new()
            .name("link-monitor".to_string())
            .spawn(move || {
                info!("network interface monitoring started");
                loop {
                    match self.source.read_event() {
                        Ok(Some(event)) => {
                            debug!(
                                link_event = event.is_link_event(),
                                deleted = event.deleted,
                                "network event received"
                            );
                            if tx.blocking_send(event).is_err() {
                                debug!("link event receiver closed, stopping monitor");
                                return;
                            }
                        }
                        Ok(None) => {}
                        Err(e) => {
                            debug!(error = %e, "interface monitoring failed to read from socket");
                            thread::sleep(READ_ERROR_BACKOFF);
                        }
                    }
                }
            })
    }
}

/// Open the routing socket of this platform.
#[cfg(target_os = "linux")]
pub fn create_socket() -> Result<Box<dyn LinkEventSource + Send>> {
    Ok(Box::new(crate::netlink::NetlinkMonitor::new()?))
}

/// Open the routing socket of this platform.
#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "netbsd",
    target_os = "dragonfly"
))]
pub fn create_socket() -> Result<Box<dyn LinkEventSource + Send>> {
    Ok(Box::new(crate::route::RouteSocketMonitor::new()?))
}

#[cfg(not(any(
    target_os = "linux",
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "netbsd",
    target_os = "dragonfly"
)))]
pub fn create_socket() -> Result<Box<dyn LinkEventSource + Send>> {
    Err(common::Error::netlink(
        "interface monitoring is not supported on this platform",
    ))
}
