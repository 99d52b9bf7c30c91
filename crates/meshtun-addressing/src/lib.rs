//! Deterministic overlay addressing
//!
//! Every peer declares a private IPv4 address. From that address and a shared
//! prefix-length configuration, each node derives the same compact endpoint
//! identifier for every peer, and from an ordered pair of identifiers the same
//! UDP ports and in-tunnel addresses. Two agents therefore agree on tunnel
//! endpoints without ever negotiating.

use std::fmt;
use std::net::Ipv4Addr;

mod set;

pub use set::EndpointSet;

/// Compact 10-bit identifier derived from a peer's private IPv4 address.
///
/// Unique as long as the deployment respects the one-endpoint-per-datacenter
/// constraint. If that constraint is violated, behavior is undefined and
/// tunnel instability is the likely result.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct EndpointId(u16);

impl EndpointId {
    /// Placeholder for an endpoint whose id could not be derived.
    ///
    /// Never stored in an [`EndpointSet`] and never used to start a tunnel.
    pub const INVALID: EndpointId = EndpointId(0xffff);

    pub fn from_raw(raw: u16) -> Self {
        EndpointId(raw)
    }

    pub fn as_u16(self) -> u16 {
        self.0
    }

    pub fn is_valid(self) -> bool {
        self != Self::INVALID
    }
}

impl fmt::Display for EndpointId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_valid() {
            write!(f, "{:03x}", self.0)
        } else {
            write!(f, "???")
        }
    }
}

/// Shared addressing configuration.
///
/// All nodes in a mesh must agree on these values; they are what makes the
/// derived ids and tunnel endpoints line up across nodes.
#[derive(Debug, Clone, Copy)]
pub struct Addressing {
    /// Prefix length shared by every private address in the mesh.
    pub common_prefix_len: u8,
    /// Prefix length that delimits a region (a group of nearby datacenters).
    pub region_prefix_len: u8,
    /// Prefix length that delimits a single datacenter.
    pub dc_prefix_len: u8,
    /// First UDP port of the per-endpoint port range.
    pub vpn_start_port: u16,
    /// This node's own private IPv4 address.
    pub local_ip: Ipv4Addr,
}

impl Addressing {
    /// View an IPv4 address through this addressing configuration.
    pub fn address(&self, ip: Ipv4Addr) -> Address {
        Address {
            ing: *self,
            ip: Some(ip),
        }
    }

    /// View an optional address, e.g. a peer tag that failed to parse.
    pub fn address_opt(&self, ip: Option<Ipv4Addr>) -> Address {
        Address { ing: *self, ip }
    }

    /// The address of the local node itself.
    pub fn local_address(&self) -> Address {
        self.address(self.local_ip)
    }
}

/// An IPv4 address bound to an [`Addressing`] configuration.
#[derive(Debug, Clone, Copy)]
pub struct Address {
    ing: Addressing,
    ip: Option<Ipv4Addr>,
}

impl Address {
    pub fn ip(&self) -> Option<Ipv4Addr> {
        self.ip
    }

    /// The address masked down to the region prefix, or None when there is
    /// no address to mask.
    pub fn region_id(&self) -> Option<Ipv4Addr> {
        self.ip.map(|ip| mask(ip, self.ing.region_prefix_len))
    }

    /// The address masked down to the datacenter prefix.
    pub fn datacenter_id(&self) -> Option<Ipv4Addr> {
        self.ip.map(|ip| mask(ip, self.ing.dc_prefix_len))
    }

    /// The unique identifier for this endpoint, made from the bits of the
    /// private address between the common prefix and the datacenter prefix.
    /// In other words, the datacenter prefix with the common prefix trimmed
    /// off, giving a 10-bit number.
    pub fn endpoint_id(&self) -> EndpointId {
        let c = self.ing.common_prefix_len;
        let d = self.ing.dc_prefix_len;

        let ip = match self.ip {
            Some(ip) => ip,
            // No address, no id.
            None => return EndpointId::INVALID,
        };

        // These cases are caught during config validation, so we won't go out
        // of our way to report them here, but we check so that a violated
        // assumption degrades to an invalid id instead of a crash.
        if c >= 24 || c >= d || d > 32 || d - c > 10 {
            return EndpointId::INVALID;
        }

        // The d-c id bits end at bit d; shift them down to the low end and
        // trim everything above the common prefix. Spans shorter than 10
        // bits simply leave the high id bits zero.
        let raw = u32::from(mask(ip, d));
        let span = u32::from(d - c);
        let id = (raw >> (32 - u32::from(d))) & ((1 << span) - 1);

        EndpointId(id as u16)
    }

    /// The in-tunnel addresses for a tunnel between this endpoint and the
    /// given remote.
    ///
    /// The 20 host bits under 172.16.0.0/12 are the two 10-bit endpoint ids,
    /// local first. The remote side computes with the ids swapped, so its
    /// local address equals our remote address and vice versa.
    pub fn tunnel_internal_ips(&self, remote_id: EndpointId) -> (Ipv4Addr, Ipv4Addr) {
        let local_id = self.endpoint_id();

        let base: u32 = (172 << 24) | (16 << 16);

        let raw_local = base | (u32::from(local_id.0) << 10) | u32::from(remote_id.0);
        let raw_remote = base | (u32::from(remote_id.0) << 10) | u32::from(local_id.0);

        (Ipv4Addr::from(raw_local), Ipv4Addr::from(raw_remote))
    }

    /// The UDP ports the two tunnel endpoints listen on: the start port plus
    /// the respective endpoint id. Symmetric for the same reason as
    /// [`Address::tunnel_internal_ips`].
    pub fn vpn_endpoint_ports(&self, remote_id: EndpointId) -> (u16, u16) {
        let offset = self.ing.vpn_start_port;
        (
            offset + self.endpoint_id().0,
            offset + remote_id.0,
        )
    }
}

impl fmt::Display for Address {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.ip {
            Some(ip) => write!(f, "{ip}"),
            None => write!(f, "-"),
        }
    }
}

fn mask(ip: Ipv4Addr, prefix_len: u8) -> Ipv4Addr {
    let raw = u32::from(ip);
    let mask = if prefix_len == 0 {
        0
    } else {
        u32::MAX << (32 - u32::from(prefix_len.min(32)))
    };
    Ipv4Addr::from(raw & mask)
}
