//! Immutable cluster snapshots

use std::collections::HashMap;

use meshtun_addressing::Addressing;
use tracing::warn;

use crate::coordinate::NetworkCoordinate;
use crate::endpoint::Endpoint;
use crate::member::Member;

/// A snapshot of the cluster as of one membership event.
///
/// Endpoints are split into the local region (same region prefix as this
/// node) and everything else, both sorted closest-first by coordinate
/// distance from this node. Snapshots are immutable; a new one is built for
/// every membership change.
#[derive(Debug, Clone)]
pub struct ClusterState {
    this_endpoint: Endpoint,
    local_endpoints: Vec<Endpoint>,
    remote_endpoints: Vec<Endpoint>,
}

impl ClusterState {
    /// Build a snapshot from the full member list.
    ///
    /// `local` is this node's own member record; a member with the same name
    /// in `members` is skipped. `coordinate_of` is the gossip layer's cached
    /// coordinate oracle.
    pub fn build(
        addressing: &Addressing,
        local: &Member,
        members: &[Member],
        coordinate_of: impl Fn(&str) -> Option<NetworkCoordinate>,
    ) -> ClusterState {
        let this_endpoint = Endpoint::from_member(addressing, local, coordinate_of(&local.name));
        let my_region = this_endpoint.region_id();
        let my_name = this_endpoint.node_name().to_string();

        let mut local_endpoints = Vec::with_capacity(members.len());
        let mut remote_endpoints = Vec::with_capacity(members.len());

        for member in members {
            if member.name == my_name {
                // Our own endpoint object is already taken care of.
                continue;
            }

            let endpoint =
                Endpoint::from_member(addressing, member, coordinate_of(&member.name));

            if endpoint.region_id() == my_region {
                local_endpoints.push(endpoint);
            } else {
                remote_endpoints.push(endpoint);
            }
        }

        let mut state = ClusterState {
            this_endpoint,
            local_endpoints,
            remote_endpoints,
        };

        let this = state.this_endpoint.clone();
        state
            .local_endpoints
            .sort_by_key(|e| this.distance_to(e));
        // No real need for the remote list to be ordered, but keep it
        // consistent; there are never more than tens of these.
        state
            .remote_endpoints
            .sort_by_key(|e| this.distance_to(e));

        state.log_id_collisions();
        state
    }

    pub fn this_endpoint(&self) -> &Endpoint {
        &self.this_endpoint
    }

    /// Peers in the same region as this node, closest first.
    pub fn local_endpoints(&self) -> &[Endpoint] {
        &self.local_endpoints
    }

    /// Peers in other regions, closest first.
    pub fn remote_endpoints(&self) -> &[Endpoint] {
        &self.remote_endpoints
    }

    /// The addressing scheme assumes one endpoint per datacenter; two peers
    /// sharing a datacenter prefix derive the same id and will fight over
    /// the same tunnels. That is a deployment error, so say so loudly, but
    /// keep the snapshot usable.
    fn log_id_collisions(&self) {
        let mut seen: HashMap<_, &str> = HashMap::new();
        for endpoint in std::iter::once(&self.this_endpoint)
            .chain(&self.local_endpoints)
            .chain(&self.remote_endpoints)
        {
            let id = endpoint.id();
            if !id.is_valid() {
                continue;
            }
            if let Some(existing) = seen.insert(id, endpoint.node_name()) {
                warn!(
                    "endpoint id {id} derived for both {existing} and {}; \
                     is more than one node deployed in this datacenter?",
                    endpoint.node_name()
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::net::Ipv4Addr;

    use crate::member::{MemberStatus, INTERNAL_IP_TAG};

    fn addressing() -> Addressing {
        Addressing {
            common_prefix_len: 8,
            region_prefix_len: 12,
            dc_prefix_len: 16,
            vpn_start_port: 1194,
            local_ip: Ipv4Addr::new(10, 5, 0, 1),
        }
    }

    fn member(name: &str, int_ip: &str) -> Member {
        let mut tags = HashMap::new();
        tags.insert(INTERNAL_IP_TAG.to_string(), int_ip.to_string());
        Member {
            name: name.into(),
            addr: Ipv4Addr::new(203, 0, 113, 10),
            port: 7946,
            status: MemberStatus::Alive,
            incarnation: 0,
            tags,
        }
    }

    fn coord_at(x: f64) -> NetworkCoordinate {
        let mut c = NetworkCoordinate::default();
        // Push the coordinate out along one axis by observing a large RTT
        // against the origin a few times.
        let origin = NetworkCoordinate::default();
        for _ in 0..32 {
            c.observe_rtt(x, &origin);
        }
        c
    }

    #[test]
    fn partitions_by_region_and_skips_self() {
        let ing = addressing();
        let local = member("me", "10.5.0.1");
        let members = vec![
            member("me", "10.5.0.1"),
            // 10.0.0.0/12 region, same as us.
            member("near", "10.6.0.1"),
            // 10.32.0.0/12, a different region.
            member("far", "10.33.0.1"),
        ];

        let state = ClusterState::build(&ing, &local, &members, |_| None);

        assert_eq!(state.this_endpoint().node_name(), "me");
        let local_names: Vec<_> = state
            .local_endpoints()
            .iter()
            .map(|e| e.node_name())
            .collect();
        let remote_names: Vec<_> = state
            .remote_endpoints()
            .iter()
            .map(|e| e.node_name())
            .collect();
        assert_eq!(local_names, vec!["near"]);
        assert_eq!(remote_names, vec!["far"]);
    }

    #[test]
    fn endpoints_sorted_by_distance() {
        let ing = addressing();
        let local = member("me", "10.5.0.1");
        let members = vec![
            member("slow", "10.6.0.1"),
            member("fast", "10.7.0.1"),
            member("unknown-rtt", "10.8.0.1"),
        ];

        let coords: HashMap<&str, NetworkCoordinate> = HashMap::from([
            ("me", NetworkCoordinate::default()),
            ("slow", coord_at(0.200)),
            ("fast", coord_at(0.010)),
        ]);

        let state = ClusterState::build(&ing, &local, &members, |name| {
            coords.get(name).cloned()
        });

        let names: Vec<_> = state
            .local_endpoints()
            .iter()
            .map(|e| e.node_name())
            .collect();
        assert_eq!(names, vec!["fast", "slow", "unknown-rtt"]);

        // Non-decreasing distances along the sorted list.
        let this = state.this_endpoint();
        let dists: Vec<_> = state
            .local_endpoints()
            .iter()
            .map(|e| this.distance_to(e))
            .collect();
        let mut sorted = dists.clone();
        sorted.sort();
        assert_eq!(dists, sorted);
    }

    #[test]
    fn unparseable_internal_ip_still_appears() {
        let ing = addressing();
        let local = member("me", "10.5.0.1");
        let mut broken = member("broken", "10.6.0.1");
        broken
            .tags
            .insert(INTERNAL_IP_TAG.to_string(), "garbage".to_string());

        let state = ClusterState::build(&ing, &local, &[broken], |_| None);

        // The endpoint is present (as a remote, no region to match) but
        // contributes no usable id.
        let all: Vec<_> = state
            .local_endpoints()
            .iter()
            .chain(state.remote_endpoints())
            .collect();
        assert_eq!(all.len(), 1);
        assert!(!all[0].id().is_valid());
    }
}
