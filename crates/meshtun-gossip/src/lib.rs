//! Gossip membership and cluster snapshots
//!
//! The [`Membership`] engine keeps the member table; the [`Gossip`] adapter
//! owns an engine and turns membership churn into immutable
//! [`ClusterState`] snapshots emitted on a channel, which is all the tunnel
//! manager ever sees of the gossip layer.

use std::collections::HashMap;
use std::net::Ipv4Addr;

use thiserror::Error;
use tokio::sync::{mpsc, Mutex, RwLock};
use tokio::time::sleep;
use tracing::debug;

use meshtun_addressing::Addressing;
use meshtun_cluster::{ClusterState, INTERNAL_IP_TAG};

mod engine;
mod wire;

pub use engine::{Membership, MembershipConfig, Tuning};
pub use wire::{GossipMessage, Sealer};

/// Gossip layer errors.
#[derive(Debug, Error)]
pub enum GossipError {
    #[error("failed to bind gossip socket on {addr}: {source}")]
    Bind {
        addr: String,
        source: std::io::Error,
    },

    #[error("failed to send gossip datagram: {0}")]
    Send(std::io::Error),

    #[error("could not resolve peer address: {0}")]
    Resolve(String),

    #[error("gossip codec error: {0}")]
    Codec(#[from] bincode::Error),

    #[error("failed to seal gossip datagram")]
    Seal,

    #[error("failed to unseal gossip datagram")]
    Unseal,

    #[error("gossip already started")]
    AlreadyStarted,
}

/// Adapter configuration.
#[derive(Debug, Clone)]
pub struct GossipConfig {
    pub node_name: String,
    /// Private address to bind on; also declared to peers as our tunnel
    /// endpoint address via the member tags.
    pub listen_ip: Ipv4Addr,
    /// Public address peers should gossip back to.
    pub advertise_ip: Ipv4Addr,
    pub port: u16,
    pub encryption_key: String,
    pub addressing: Addressing,
    pub tuning: Tuning,
}

/// Owns the membership engine and produces [`ClusterState`] snapshots.
pub struct Gossip {
    addressing: Addressing,
    membership: Membership,
    coalesce: std::time::Duration,
    changes_rx: Mutex<Option<mpsc::Receiver<()>>>,
    latest: RwLock<Option<ClusterState>>,
}

impl Gossip {
    /// Bind the gossip socket; the engine loops start in [`Gossip::start`].
    pub async fn bind(config: GossipConfig) -> Result<Gossip, GossipError> {
        let mut tags = HashMap::new();
        tags.insert(INTERNAL_IP_TAG.to_string(), config.listen_ip.to_string());

        let coalesce = config.tuning.coalesce;
        let (membership, changes_rx) = Membership::bind(MembershipConfig {
            node_name: config.node_name,
            bind_addr: config.listen_ip,
            advertise_addr: config.advertise_ip,
            port: config.port,
            tags,
            encryption_key: config.encryption_key,
            tuning: config.tuning,
        })
        .await?;

        Ok(Gossip {
            addressing: config.addressing,
            membership,
            coalesce,
            changes_rx: Mutex::new(Some(changes_rx)),
            latest: RwLock::new(None),
        })
    }

    /// Direct access to the membership engine, mostly for tests.
    pub fn membership(&self) -> &Membership {
        &self.membership
    }

    /// Run the gossip layer: emit an initial [`ClusterState`], then one per
    /// batch of membership changes. Returns once the engine is shut down or
    /// the consumer goes away, so it is usually spawned.
    pub async fn start(&self, change_tx: mpsc::Sender<ClusterState>) -> Result<(), GossipError> {
        let mut changes_rx = self
            .changes_rx
            .lock()
            .await
            .take()
            .ok_or(GossipError::AlreadyStarted)?;

        self.membership.start();

        let initial = self.refresh_state().await;
        if change_tx.send(initial).await.is_err() {
            return Ok(());
        }

        let mut shutdown = self.membership.shutdown_signal();
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    debug!("gossip layer shutting down");
                    return Ok(());
                }
                changed = changes_rx.recv() => {
                    if changed.is_none() {
                        return Ok(());
                    }
                    // Membership events arrive in bursts (a sync brings many
                    // records); let the burst settle and emit one snapshot.
                    sleep(self.coalesce).await;
                    while changes_rx.try_recv().is_ok() {}

                    let state = self.refresh_state().await;
                    if change_tx.send(state).await.is_err() {
                        return Ok(());
                    }
                }
            }
        }
    }

    /// Contact seed peers to merge into an existing pool.
    pub async fn join(&self, peers: &[String]) -> Result<usize, GossipError> {
        self.membership.join(peers).await
    }

    /// The most recently built snapshot, if any.
    pub async fn latest_cluster_state(&self) -> Option<ClusterState> {
        self.latest.read().await.clone()
    }

    /// Announce departure and stop the engine. [`Gossip::start`] returns
    /// shortly after.
    pub async fn close(&self) {
        self.membership.leave().await;
        self.membership.shutdown();
    }

    async fn refresh_state(&self) -> ClusterState {
        let local = self.membership.local_member().await;
        let members = self.membership.members().await;
        let coords = self.membership.coordinates().await;

        let state = ClusterState::build(&self.addressing, &local, &members, |name| {
            coords.get(name).cloned()
        });

        *self.latest.write().await = Some(state.clone());
        state
    }
}
