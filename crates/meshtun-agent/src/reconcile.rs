//! The reconcile diff
//!
//! One pure function from (cluster snapshot, tunnel snapshot) to the set of
//! tunnels to start and to close. Pure so it can be exercised exhaustively;
//! re-running it against unchanged inputs always yields empty diffs.

use std::collections::HashMap;

use meshtun_addressing::{EndpointId, EndpointSet};
use meshtun_cluster::{ClusterState, Endpoint};
use meshtun_vpn::{TunnelsState, VpnState};

/// What one reconcile pass decided.
#[derive(Debug)]
pub struct ReconcilePlan {
    /// Live remote peers with no tunnel yet.
    pub to_start: EndpointSet,
    /// Tunnels whose peer is no longer live, minus those already exiting.
    pub to_close: EndpointSet,
    /// Remote peers that have not deliberately left the cluster. Not used
    /// for tunnel diffing (failed peers get no tunnel), but downstream
    /// service registration keys off it.
    pub expected: EndpointSet,
}

/// Remote endpoints with a usable id, keyed by id.
pub fn remote_endpoints_by_id(cluster: &ClusterState) -> HashMap<EndpointId, &Endpoint> {
    cluster
        .remote_endpoints()
        .iter()
        .filter(|e| e.id().is_valid())
        .map(|e| (e.id(), e))
        .collect()
}

pub fn plan(cluster: &ClusterState, tunnels: &TunnelsState) -> ReconcilePlan {
    // Tunnels only ever go to remote-region peers that gossip currently
    // believes are alive; if gossip cannot reach a peer, openvpn will not
    // fare any better.
    let mut expected = EndpointSet::new();
    let mut live = EndpointSet::new();
    for endpoint in cluster.remote_endpoints() {
        let id = endpoint.id();
        if endpoint.expected_alive() {
            expected.add(id);
        }
        if endpoint.alive() {
            live.add(id);
        }
    }

    let mut have = EndpointSet::new();
    let mut exiting = EndpointSet::new();
    for tunnel in tunnels.tunnels() {
        have.add(tunnel.endpoint_id);
        if tunnel.state == VpnState::Exiting {
            exiting.add(tunnel.endpoint_id);
        }
    }

    // Do not re-issue a close for a tunnel that is already on its way out.
    let to_start = live.union(&have).subtract(&have);
    let to_close = live.union(&have).subtract(&live).subtract(&exiting);

    ReconcilePlan {
        to_start,
        to_close,
        expected,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::net::Ipv4Addr;

    use meshtun_addressing::Addressing;
    use meshtun_cluster::{Member, MemberStatus, INTERNAL_IP_TAG};
    use meshtun_vpn::Tunnel;

    fn addressing() -> Addressing {
        Addressing {
            common_prefix_len: 8,
            region_prefix_len: 12,
            dc_prefix_len: 16,
            vpn_start_port: 1194,
            local_ip: Ipv4Addr::new(10, 5, 0, 1),
        }
    }

    fn member(name: &str, int_ip: &str, status: MemberStatus) -> Member {
        let mut tags = HashMap::new();
        tags.insert(INTERNAL_IP_TAG.to_string(), int_ip.to_string());
        Member {
            name: name.into(),
            addr: Ipv4Addr::new(203, 0, 113, 77),
            port: 7946,
            status,
            incarnation: 0,
            tags,
        }
    }

    fn cluster(members: Vec<Member>) -> ClusterState {
        let local = member("me", "10.5.0.1", MemberStatus::Alive);
        ClusterState::build(&addressing(), &local, &members, |_| None)
    }

    fn id(raw: u16) -> EndpointId {
        EndpointId::from_raw(raw)
    }

    fn tunnels(entries: &[(u16, VpnState)]) -> TunnelsState {
        TunnelsState::new(
            entries
                .iter()
                .map(|&(raw, state)| Tunnel {
                    endpoint_id: id(raw),
                    state,
                })
                .collect(),
        )
    }

    #[test]
    fn live_remote_without_tunnel_is_started() {
        // 10.33.0.1 is in another region (10.32.0.0/12), id 0x021.
        let cluster = cluster(vec![member("far", "10.33.0.1", MemberStatus::Alive)]);
        let plan = plan(&cluster, &tunnels(&[]));

        assert!(plan.to_start.has(id(0x021)));
        assert_eq!(plan.to_start.len(), 1);
        assert!(plan.to_close.is_empty());
        assert!(plan.expected.has(id(0x021)));
    }

    #[test]
    fn unchanged_inputs_reconcile_to_nothing() {
        let cluster = cluster(vec![member("far", "10.33.0.1", MemberStatus::Alive)]);
        let state = tunnels(&[(0x021, VpnState::Connected)]);

        for _ in 0..3 {
            let plan = plan(&cluster, &state);
            assert!(plan.to_start.is_empty());
            assert!(plan.to_close.is_empty());
        }
    }

    #[test]
    fn failed_remote_closes_tunnel_but_stays_expected() {
        let cluster = cluster(vec![member("far", "10.33.0.1", MemberStatus::Failed)]);
        let plan = plan(&cluster, &tunnels(&[(0x021, VpnState::Connected)]));

        assert!(plan.to_start.is_empty());
        assert!(plan.to_close.has(id(0x021)));
        // A failed peer may come back; downstream registration keeps it.
        assert!(plan.expected.has(id(0x021)));
    }

    #[test]
    fn leaving_remote_closes_tunnel_and_is_unexpected() {
        let cluster = cluster(vec![member("far", "10.33.0.1", MemberStatus::Leaving)]);
        let plan = plan(&cluster, &tunnels(&[(0x021, VpnState::Connected)]));

        assert!(plan.to_close.has(id(0x021)));
        assert!(!plan.expected.has(id(0x021)));
    }

    #[test]
    fn exiting_tunnel_is_not_closed_again() {
        let cluster = cluster(vec![member("far", "10.33.0.1", MemberStatus::Failed)]);
        let plan = plan(&cluster, &tunnels(&[(0x021, VpnState::Exiting)]));

        assert!(plan.to_close.is_empty());
    }

    #[test]
    fn two_live_remotes_start_together() {
        let cluster = cluster(vec![
            member("far-a", "10.33.0.1", MemberStatus::Alive),
            member("far-b", "10.34.0.1", MemberStatus::Alive),
        ]);
        let plan = plan(&cluster, &tunnels(&[]));

        assert_eq!(plan.to_start.len(), 2);
        assert!(plan.to_start.has(id(0x021)));
        assert!(plan.to_start.has(id(0x022)));
    }

    #[test]
    fn same_region_peers_get_no_tunnels() {
        // 10.6.0.1 shares our 10.0.0.0/12 region; routed locally, not
        // tunneled.
        let cluster = cluster(vec![member("near", "10.6.0.1", MemberStatus::Alive)]);
        let plan = plan(&cluster, &tunnels(&[]));

        assert!(plan.to_start.is_empty());
        assert!(plan.expected.is_empty());
    }

    #[test]
    fn peer_without_usable_id_contributes_nothing() {
        let mut broken = member("broken", "10.33.0.1", MemberStatus::Alive);
        broken
            .tags
            .insert(INTERNAL_IP_TAG.to_string(), "garbage".to_string());
        let cluster = cluster(vec![broken]);
        let plan = plan(&cluster, &tunnels(&[]));

        assert!(plan.to_start.is_empty());
        assert!(plan.expected.is_empty());
        assert!(remote_endpoints_by_id(&cluster).is_empty());
    }

    #[test]
    fn start_failure_reproduces_the_same_plan() {
        // If a start fails, the maps stay unchanged and the next pass must
        // ask for the same tunnel again.
        let cluster = cluster(vec![member("far", "10.33.0.1", MemberStatus::Alive)]);
        let first = plan(&cluster, &tunnels(&[]));
        let second = plan(&cluster, &tunnels(&[]));

        assert!(first.to_start.has(id(0x021)));
        assert_eq!(first.to_start, second.to_start);
    }
}
