//! Local interface queries.

use crate::event::{IFF_LOWER_UP, IFF_RUNNING};
use common::{Error, Result};
use nix::ifaddrs::getifaddrs;
use std::net::Ipv4Addr;
use tracing::{debug, info};

fn is_loopback_name(name: &str) -> bool {
    name.as_bytes()
        .get(..2)
        .is_some_and(|prefix| prefix.eq_ignore_ascii_case(b"lo"))
}

/// A link is up when it is both running and has carrier.
fn flags_up(flags: u32) -> bool {
    flags & IFF_RUNNING != 0 && flags & IFF_LOWER_UP != 0
}

/// Every IPv4 address on a non-loopback interface.
pub fn local_ipv4_addresses() -> Result<Vec<Ipv4Addr>> {
    let addrs = getifaddrs()
        .map_err(|e| Error::netlink(format!("getifaddrs failed: {}", e)))?;

    Ok(addrs
        .filter(|ifa| !is_loopback_name(&ifa.interface_name))
        .filter_map(|ifa| {
            ifa.address
                .as_ref()
                .and_then(|a| a.as_sockaddr_in())
                .map(|sin| Ipv4Addr::from(sin.ip()))
        })
        .collect())
}

/// Whether the named interface is running with carrier.
///
/// Unknown interfaces are reported down.
pub fn is_interface_up(name: &str) -> Result<bool> {
    let addrs = getifaddrs()
        .map_err(|e| Error::netlink(format!("getifaddrs failed: {}", e)))?;

    for ifa in addrs {
        if !ifa.interface_name.eq_ignore_ascii_case(name) {
            continue;
        }
        let flags = ifa.flags.bits() as u32;
        debug!(interface = name, flags, "network interface flags");

        let up = flags_up(flags);
        if !up {
            if flags & IFF_RUNNING == 0 {
                info!(interface = name, "network interface link is inactive");
            } else {
                info!(interface = name, "network interface link is down");
            }
        }
        return Ok(up);
    }

    debug!(interface = name, "network interface not found");
    Ok(false)
}

/// Whether at least one of `names` is up. An empty list means interface
/// monitoring is off, which counts as up.
pub fn any_interface_up(names: &[String]) -> Result<bool> {
    if names.is_empty() {
        return Ok(true);
    }

    for name in names.iter().filter(|n| !is_loopback_name(n)) {
        if is_interface_up(name)? {
            debug!(interface = %name, "network interface is up");
            return Ok(true);
        }
    }
    Ok(false)
}
