//! Cluster model shared between the gossip layer and the tunnel manager
//!
//! The gossip engine produces [`Member`] records; the manager consumes
//! [`ClusterState`] snapshots built from them. Everything in between is a
//! plain value, so snapshots can be handed across tasks freely.

mod cluster;
mod coordinate;
mod endpoint;
mod member;

pub use cluster::ClusterState;
pub use coordinate::NetworkCoordinate;
pub use endpoint::{Endpoint, MAX_DISTANCE};
pub use member::{Member, MemberStatus, INTERNAL_IP_TAG};
