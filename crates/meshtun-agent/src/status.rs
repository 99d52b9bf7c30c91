//! Human-readable dumps of the agent's state objects, for debug logging

use std::fmt::Write;

use meshtun_cluster::{ClusterState, Endpoint};
use meshtun_vpn::TunnelsState;

pub fn format_cluster_state(state: &ClusterState) -> String {
    let mut out = String::new();
    let _ = writeln!(
        out,
        "{:<16} {:>4} {:<21} {:<15} {:<11} {:<11} {:>14} {}",
        "name", "eid", "global address", "local address", "region", "datacenter", "distance", "status"
    );

    let this = state.this_endpoint();
    write_endpoint(&mut out, this, this);
    for endpoint in state.local_endpoints() {
        write_endpoint(&mut out, endpoint, this);
    }
    for endpoint in state.remote_endpoints() {
        write_endpoint(&mut out, endpoint, this);
    }
    out
}

fn write_endpoint(out: &mut String, endpoint: &Endpoint, this: &Endpoint) {
    let opt = |v: Option<std::net::Ipv4Addr>| match v {
        Some(ip) => ip.to_string(),
        None => "-".to_string(),
    };
    let distance = match endpoint.distance_to(this) {
        i64::MAX => "?".to_string(),
        d => d.to_string(),
    };
    let _ = writeln!(
        out,
        "{:<16} {:>4} {:<21} {:<15} {:<11} {:<11} {:>14} {}",
        endpoint.node_name(),
        endpoint.id().to_string(),
        format!("{}:{}", endpoint.gossip_addr(), endpoint.gossip_port()),
        opt(endpoint.internal_addr()),
        opt(endpoint.region_id()),
        opt(endpoint.datacenter_id()),
        distance,
        endpoint.status(),
    );
}

pub fn format_tunnels_state(state: &TunnelsState) -> String {
    if state.is_empty() {
        return "(no active tunnels)\n".to_string();
    }

    let mut out = String::new();
    let _ = writeln!(out, "{:>4} {}", "eid", "state");
    for tunnel in state.tunnels() {
        let _ = writeln!(out, "{:>4} {}", tunnel.endpoint_id.to_string(), tunnel.state);
    }
    out
}
