//! Local interface address resolution

use std::net::Ipv4Addr;

use nix::ifaddrs::getifaddrs;
use tracing::info;

use crate::config::ConfigError;

/// First IPv4 address of the named interface.
///
/// An interface can carry several addresses; we take the first and say so,
/// since which one we bind is visible to the rest of the mesh.
pub fn interface_ipv4(name: &str) -> Result<Ipv4Addr, ConfigError> {
    let addrs = getifaddrs().map_err(ConfigError::ListInterfaces)?;

    let mut seen_interface = false;
    let mut found: Vec<Ipv4Addr> = Vec::new();

    for ifaddr in addrs {
        if ifaddr.interface_name != name {
            continue;
        }
        seen_interface = true;
        let Some(storage) = ifaddr.address else {
            continue;
        };
        if let Some(sin) = storage.as_sockaddr_in() {
            found.push(Ipv4Addr::from(sin.ip()));
        }
    }

    if !seen_interface {
        return Err(ConfigError::InterfaceNotFound(name.to_string()));
    }

    match found.first() {
        None => Err(ConfigError::InterfaceNoIpv4(name.to_string())),
        Some(&ip) => {
            info!("{name} address is {ip}");
            if found.len() > 1 {
                info!("{name} has multiple IPv4 addresses, picked one arbitrarily");
            }
            Ok(ip)
        }
    }
}
