//! Network interface monitoring
//!
//! Reports link up/down and address add/remove notifications from the
//! kernel, and answers questions about local interfaces. Events are raw:
//! deciding what a vanished address means for the cluster is up to the
//! caller.
//!
//! # Example
//!
//! ```no_run
//! use netmon::LinkEventMonitor;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut monitor = LinkEventMonitor::new()?;
//!
//! if let Some(event) = monitor.read_event()? {
//!     println!("link_event={} deleted={}", event.is_link_event(), event.deleted);
//! }
//! # Ok(())
//! # }
//! ```

mod event;
mod interfaces;
mod monitor;
#[cfg(target_os = "linux")]
mod netlink;
#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "netbsd",
    target_os = "dragonfly"
))]
mod route;

pub use event::{
    LinkEvent, LinkEventKind, LinkEventSource, NetworkEvent, decode_netlink_messages,
    decode_route_message,
};
pub use interfaces::{any_interface_up, is_interface_up, local_ipv4_addresses};
pub use monitor::{LinkEventMonitor, create_socket};
#[cfg(target_os = "linux")]
pub use netlink::NetlinkMonitor;
#[cfg(any(
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd",
    target_os = "openbsd",
    target_os = "netbsd",
    target_os = "dragonfly"
))]
pub use route::RouteSocketMonitor;
