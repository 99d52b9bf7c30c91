//! Membership records as the gossip engine sees them

use std::collections::HashMap;
use std::fmt;
use std::net::Ipv4Addr;

use serde::{Deserialize, Serialize};

/// Tag under which every node declares its private IPv4 address.
pub const INTERNAL_IP_TAG: &str = "int_ip";

/// Liveness of a member as agreed on by the gossip layer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberStatus {
    Alive,
    Leaving,
    Left,
    Failed,
    Unknown,
}

impl fmt::Display for MemberStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            MemberStatus::Alive => "alive",
            MemberStatus::Leaving => "leaving",
            MemberStatus::Left => "left",
            MemberStatus::Failed => "failed",
            MemberStatus::Unknown => "unknown",
        };
        f.write_str(s)
    }
}

/// One member of the gossip pool.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Member {
    /// Cluster-unique node name.
    pub name: String,
    /// Address the member gossips from (its public address).
    pub addr: Ipv4Addr,
    /// UDP port the member gossips on.
    pub port: u16,
    pub status: MemberStatus,
    /// Monotonic per-member counter; a higher incarnation always wins when
    /// two nodes disagree about a member's status.
    pub incarnation: u64,
    /// Free-form tags; `int_ip` carries the declared private address.
    pub tags: HashMap<String, String>,
}

impl Member {
    /// The member's declared private IPv4 address, if the tag is present and
    /// parses. A member without one still gossips, but never gets a tunnel.
    pub fn internal_ip(&self) -> Option<Ipv4Addr> {
        self.tags.get(INTERNAL_IP_TAG)?.parse().ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn internal_ip_parses_tag() {
        let mut member = Member {
            name: "node-a".into(),
            addr: Ipv4Addr::new(203, 0, 113, 5),
            port: 7946,
            status: MemberStatus::Alive,
            incarnation: 3,
            tags: HashMap::new(),
        };
        assert_eq!(member.internal_ip(), None);

        member
            .tags
            .insert(INTERNAL_IP_TAG.to_string(), "10.5.0.1".to_string());
        assert_eq!(member.internal_ip(), Some(Ipv4Addr::new(10, 5, 0, 1)));

        member
            .tags
            .insert(INTERNAL_IP_TAG.to_string(), "not-an-ip".to_string());
        assert_eq!(member.internal_ip(), None);
    }
}
