//! Per-peer view of a cluster member

use std::net::Ipv4Addr;

use meshtun_addressing::{Address, Addressing, EndpointId};

use crate::coordinate::NetworkCoordinate;
use crate::member::{Member, MemberStatus};

/// Distance reported when either side has no network coordinate yet.
/// Effectively "infinitely far": peers without coordinates sort last.
pub const MAX_DISTANCE: i64 = i64::MAX;

/// A peer node as seen through the gossip layer, enriched with overlay
/// addressing and a network coordinate.
///
/// An endpoint copies the few member fields it needs at construction time,
/// so a [`crate::ClusterState`] holds no references back into the membership
/// engine and can be shared across tasks as a plain value.
#[derive(Debug, Clone)]
pub struct Endpoint {
    node_name: String,
    gossip_addr: Ipv4Addr,
    gossip_port: u16,
    internal_addr: Option<Ipv4Addr>,
    status: MemberStatus,
    coordinate: Option<NetworkCoordinate>,
    addressing: Addressing,
}

impl Endpoint {
    pub fn from_member(
        addressing: &Addressing,
        member: &Member,
        coordinate: Option<NetworkCoordinate>,
    ) -> Self {
        Endpoint {
            node_name: member.name.clone(),
            gossip_addr: member.addr,
            gossip_port: member.port,
            internal_addr: member.internal_ip(),
            status: member.status,
            coordinate,
            addressing: *addressing,
        }
    }

    pub fn node_name(&self) -> &str {
        &self.node_name
    }

    pub fn gossip_addr(&self) -> Ipv4Addr {
        self.gossip_addr
    }

    pub fn gossip_port(&self) -> u16 {
        self.gossip_port
    }

    pub fn internal_addr(&self) -> Option<Ipv4Addr> {
        self.internal_addr
    }

    pub fn status(&self) -> MemberStatus {
        self.status
    }

    pub fn alive(&self) -> bool {
        self.status == MemberStatus::Alive
    }

    /// Whether the peer is expected to be up: anything that has not
    /// deliberately left the cluster. A failed peer is still expected alive.
    pub fn expected_alive(&self) -> bool {
        !matches!(self.status, MemberStatus::Leaving | MemberStatus::Left)
    }

    pub fn address(&self) -> Address {
        self.addressing.address_opt(self.internal_addr)
    }

    pub fn region_id(&self) -> Option<Ipv4Addr> {
        self.address().region_id()
    }

    pub fn datacenter_id(&self) -> Option<Ipv4Addr> {
        self.address().datacenter_id()
    }

    pub fn id(&self) -> EndpointId {
        self.address().endpoint_id()
    }

    pub fn coordinate(&self) -> Option<&NetworkCoordinate> {
        self.coordinate.as_ref()
    }

    /// Round-trip distance to the other endpoint, in nanoseconds.
    ///
    /// Distances mean nothing in absolute terms; they are only good for
    /// sorting peers into a closest-first list. Returns [`MAX_DISTANCE`]
    /// until both sides have a coordinate.
    pub fn distance_to(&self, other: &Endpoint) -> i64 {
        match (&self.coordinate, &other.coordinate) {
            (Some(a), Some(b)) => (a.distance_to(b) * 1e9) as i64,
            _ => MAX_DISTANCE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    use crate::member::INTERNAL_IP_TAG;

    fn addressing() -> Addressing {
        Addressing {
            common_prefix_len: 8,
            region_prefix_len: 12,
            dc_prefix_len: 16,
            vpn_start_port: 1194,
            local_ip: Ipv4Addr::new(10, 5, 0, 1),
        }
    }

    fn member(name: &str, int_ip: Option<&str>, status: MemberStatus) -> Member {
        let mut tags = HashMap::new();
        if let Some(ip) = int_ip {
            tags.insert(INTERNAL_IP_TAG.to_string(), ip.to_string());
        }
        Member {
            name: name.into(),
            addr: Ipv4Addr::new(203, 0, 113, 10),
            port: 7946,
            status,
            incarnation: 0,
            tags,
        }
    }

    #[test]
    fn liveness_predicates() {
        let ing = addressing();
        let cases = [
            (MemberStatus::Alive, true, true),
            (MemberStatus::Failed, false, true),
            (MemberStatus::Unknown, false, true),
            (MemberStatus::Leaving, false, false),
            (MemberStatus::Left, false, false),
        ];
        for (status, alive, expected) in cases {
            let e = Endpoint::from_member(&ing, &member("n", Some("10.9.0.1"), status), None);
            assert_eq!(e.alive(), alive, "{status}");
            assert_eq!(e.expected_alive(), expected, "{status}");
        }
    }

    #[test]
    fn missing_internal_ip_yields_invalid_id() {
        let ing = addressing();
        let e = Endpoint::from_member(&ing, &member("n", None, MemberStatus::Alive), None);
        assert_eq!(e.internal_addr(), None);
        assert!(!e.id().is_valid());
    }

    #[test]
    fn distance_without_coordinates_is_infinite() {
        let ing = addressing();
        let a = Endpoint::from_member(&ing, &member("a", Some("10.1.0.1"), MemberStatus::Alive), None);
        let b = Endpoint::from_member(
            &ing,
            &member("b", Some("10.2.0.1"), MemberStatus::Alive),
            Some(NetworkCoordinate::default()),
        );
        assert_eq!(a.distance_to(&b), MAX_DISTANCE);
        assert_eq!(b.distance_to(&a), MAX_DISTANCE);

        let c = Endpoint::from_member(
            &ing,
            &member("c", Some("10.3.0.1"), MemberStatus::Alive),
            Some(NetworkCoordinate::default()),
        );
        assert!(b.distance_to(&c) < MAX_DISTANCE);
        assert!(b.distance_to(&c) >= 0);
    }
}
