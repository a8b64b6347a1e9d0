//! Link and address change events and their wire decoders.
//!
//! Both decoders are pure functions over a received buffer so they can be
//! exercised with synthetic messages on any platform.

use common::Result;
use std::fmt;

// rtnetlink message types, same values as libc on Linux
const NLMSG_DONE: u16 = 3;
const RTM_NEWLINK: u16 = 16;
const RTM_DELLINK: u16 = 17;
const RTM_NEWADDR: u16 = 20;
const RTM_DELADDR: u16 = 21;

// interface flags
pub(crate) const IFF_RUNNING: u32 = 0x40;
pub(crate) const IFF_LOWER_UP: u32 = 0x10000;

const NLMSG_HDRLEN: usize = 16;
const NLMSG_ALIGNTO: usize = 4;

/// Offset of `ifi_flags` from the start of a netlink message.
const IFINFO_FLAGS_OFFSET: usize = NLMSG_HDRLEN + 8;

// BSD routing socket message types
const RTM_ADD: u8 = 0x1;
const RTM_DELETE: u8 = 0x2;
const RTM_BSD_NEWADDR: u8 = 0xc;
const RTM_BSD_DELADDR: u8 = 0xd;

/// Offset of `rtm_type` in `struct rt_msghdr`.
const RTM_TYPE_OFFSET: usize = 3;

/// What changed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkEventKind {
    /// Interface link state
    Link,
    /// Interface address
    Address,
}

/// One decoded change notification.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkEvent {
    pub kind: LinkEventKind,
    pub deleted: bool,
}

impl LinkEvent {
    pub fn link(deleted: bool) -> Self {
        Self {
            kind: LinkEventKind::Link,
            deleted,
        }
    }

    pub fn address(deleted: bool) -> Self {
        Self {
            kind: LinkEventKind::Address,
            deleted,
        }
    }

    pub fn is_link_event(&self) -> bool {
        self.kind == LinkEventKind::Link
    }

    /// The `(link_event, deleted)` pair.
    pub fn as_pair(&self) -> (bool, bool) {
        (self.is_link_event(), self.deleted)
    }

    /// What the event means for this node.
    pub fn network_event(&self) -> NetworkEvent {
        match (self.kind, self.deleted) {
            (LinkEventKind::Link, true) => NetworkEvent::LinkInactive,
            (LinkEventKind::Link, false) => NetworkEvent::LinkActive,
            (LinkEventKind::Address, true) => NetworkEvent::IpRemoved,
            (LinkEventKind::Address, false) => NetworkEvent::IpAssigned,
        }
    }
}

/// Network events as consumed by the cluster state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NetworkEvent {
    LinkActive,
    LinkInactive,
    IpAssigned,
    IpRemoved,
}

impl fmt::Display for NetworkEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            NetworkEvent::LinkActive => write!(f, "NETWORK LINK ACTIVE"),
            NetworkEvent::LinkInactive => write!(f, "NETWORK LINK INACTIVE"),
            NetworkEvent::IpAssigned => write!(f, "NETWORK IP ASSIGNED"),
            NetworkEvent::IpRemoved => write!(f, "NETWORK IP REMOVED"),
        }
    }
}

/// A blocking source of link events.
#[cfg_attr(test, mockall::automock)]
pub trait LinkEventSource {
    /// Block until a message arrives and decode it.
    ///
    /// `Ok(None)` means the message carried nothing of interest.
    fn read_event(&mut self) -> Result<Option<LinkEvent>>;
}

/// Decode the first link or address message in a netlink datagram.
///
/// Any link message is a link event; it counts as deleted on `RTM_DELLINK`
/// or when the interface lacks `IFF_RUNNING` or `IFF_LOWER_UP`. Address
/// messages are deleted only on `RTM_DELADDR`.
pub fn decode_netlink_messages(buf: &[u8]) -> Option<LinkEvent> {
    let mut offset = 0;

    while buf.len() - offset >= NLMSG_HDRLEN {
        let msg = &buf[offset..];
        let msg_len = u32::from_ne_bytes([msg[0], msg[1], msg[2], msg[3]]) as usize;
        if msg_len < NLMSG_HDRLEN || msg_len > msg.len() {
            break;
        }
        let msg_type = u16::from_ne_bytes([msg[4], msg[5]]);

        match msg_type {
            NLMSG_DONE => break,
            RTM_NEWLINK | RTM_DELLINK => {
                if msg_len < IFINFO_FLAGS_OFFSET + 4 {
                    tracing::debug!(msg_len, "truncated link message");
                    break;
                }
                let f = &msg[IFINFO_FLAGS_OFFSET..IFINFO_FLAGS_OFFSET + 4];
                let flags = u32::from_ne_bytes([f[0], f[1], f[2], f[3]]);
                let down = flags & IFF_RUNNING == 0 || flags & IFF_LOWER_UP == 0;
                return Some(LinkEvent::link(msg_type == RTM_DELLINK || down));
            }
            RTM_NEWADDR => return Some(LinkEvent::address(false)),
            RTM_DELADDR => return Some(LinkEvent::address(true)),
            other => tracing::trace!(nlmsg_type = other, "unknown nlmsg_type"),
        }

        let advance = (msg_len + NLMSG_ALIGNTO - 1) & !(NLMSG_ALIGNTO - 1);
        if advance >= buf.len() - offset {
            break;
        }
        offset += advance;
    }

    None
}

/// Decode a BSD routing socket message.
pub fn decode_route_message(buf: &[u8]) -> Option<LinkEvent> {
    let rtm_type = *buf.get(RTM_TYPE_OFFSET)?;
    match rtm_type {
        RTM_ADD => Some(LinkEvent::link(false)),
        RTM_DELETE => Some(LinkEvent::link(true)),
        RTM_BSD_NEWADDR => Some(LinkEvent::address(false)),
        RTM_BSD_DELADDR => Some(LinkEvent::address(true)),
        other => {
            tracing::trace!(rtm_type = other, "unknown rtm_type");
            None
        }
    }
}
