//! The tunnel supervisor
//!
//! Owns the map of live tunnel processes and translates per-process state
//! changes into cluster-level [`TunnelsState`] snapshots. The reconciler is
//! the only caller of the mutating operations; per-tunnel monitor tasks are
//! the only producers of snapshots.

use std::collections::HashMap;
use std::net::SocketAddrV4;
use std::sync::Arc;

use thiserror::Error;
use tokio::sync::{watch, RwLock};
use tracing::debug;

use meshtun_addressing::{Addressing, EndpointId};
use meshtun_cluster::Endpoint;

use crate::{TunnelControl, TunnelLauncher, TunnelSpec, VpnError, VpnEvents, VpnState};

/// One supervised tunnel and its current state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Tunnel {
    pub endpoint_id: EndpointId,
    pub state: VpnState,
}

/// Immutable snapshot of every supervised tunnel, one entry per endpoint
/// id. A tunnel that has exited is simply absent.
#[derive(Debug, Clone, Default)]
pub struct TunnelsState {
    tunnels: Vec<Tunnel>,
}

impl TunnelsState {
    /// Assemble a snapshot directly. Production snapshots come from the
    /// supervisor; this is for consumers that need to fabricate one.
    pub fn new(tunnels: Vec<Tunnel>) -> TunnelsState {
        TunnelsState { tunnels }
    }

    fn from_states(states: &HashMap<EndpointId, VpnState>) -> TunnelsState {
        TunnelsState {
            tunnels: states
                .iter()
                .map(|(&endpoint_id, &state)| Tunnel { endpoint_id, state })
                .collect(),
        }
    }

    pub fn tunnels(&self) -> &[Tunnel] {
        &self.tunnels
    }

    pub fn state_of(&self, id: EndpointId) -> Option<VpnState> {
        self.tunnels
            .iter()
            .find(|t| t.endpoint_id == id)
            .map(|t| t.state)
    }

    pub fn is_empty(&self) -> bool {
        self.tunnels.is_empty()
    }
}

/// Supervisor errors.
#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("already have tunnel for endpoint {0}")]
    AlreadyRunning(EndpointId),

    #[error("endpoint {0} has no usable endpoint id")]
    InvalidEndpoint(String),

    #[error(transparent)]
    Vpn(#[from] VpnError),
}

#[derive(Default)]
struct Maps {
    vpns: HashMap<EndpointId, Box<dyn TunnelControl>>,
    states: HashMap<EndpointId, VpnState>,
}

struct Inner {
    addressing: Addressing,
    launcher: Arc<dyn TunnelLauncher>,
    // One lock over both maps so every snapshot is a consistent view.
    maps: RwLock<Maps>,
    change_tx: watch::Sender<TunnelsState>,
}

/// Owns all tunnel processes for this node.
#[derive(Clone)]
pub struct TunnelSupervisor {
    inner: Arc<Inner>,
}

impl TunnelSupervisor {
    /// `change_tx` is the snapshot side of a watch channel; the manager
    /// keeps the receiver. The watch keeps only the newest snapshot, so a
    /// busy reconciler skips straight to the current picture instead of
    /// stalling the monitors, while snapshot order still follows lock
    /// acquisition order.
    pub fn new(
        addressing: Addressing,
        launcher: Arc<dyn TunnelLauncher>,
        change_tx: watch::Sender<TunnelsState>,
    ) -> TunnelSupervisor {
        TunnelSupervisor {
            inner: Arc::new(Inner {
                addressing,
                launcher,
                maps: RwLock::new(Maps::default()),
                change_tx,
            }),
        }
    }

    /// Launch a tunnel to the given peer, deriving ports and in-tunnel
    /// addresses from the addressing algebra.
    ///
    /// On launch failure the maps are untouched and the error is returned;
    /// the caller retries on its next pass.
    pub async fn start_tunnel(&self, endpoint: &Endpoint) -> Result<(), SupervisorError> {
        let id = endpoint.id();
        if !id.is_valid() {
            return Err(SupervisorError::InvalidEndpoint(
                endpoint.node_name().to_string(),
            ));
        }

        // The write lock is held across the launch: no window where a
        // concurrent start for the same endpoint could slip in.
        let mut maps = self.inner.maps.write().await;
        if maps.vpns.contains_key(&id) {
            return Err(SupervisorError::AlreadyRunning(id));
        }

        let local = self.inner.addressing.local_address();
        let (local_port, remote_port) = local.vpn_endpoint_ports(id);
        let (tunnel_local_ip, tunnel_remote_ip) = local.tunnel_internal_ips(id);

        let spec = TunnelSpec {
            endpoint_id: id,
            local_addr: SocketAddrV4::new(self.inner.addressing.local_ip, local_port),
            remote_addr: SocketAddrV4::new(endpoint.gossip_addr(), remote_port),
            tunnel_local_ip,
            tunnel_remote_ip,
        };

        let process = self.inner.launcher.launch(spec).await?;
        let (control, events) = process.into_parts();

        maps.vpns.insert(id, control);
        maps.states.insert(id, VpnState::Launching);

        let supervisor = self.clone();
        tokio::spawn(async move { supervisor.monitor_tunnel(id, events).await });

        Ok(())
    }

    /// Signal the tunnel for `id` to shut down cleanly. A missing tunnel is
    /// a no-op: the desired outcome already holds. Cleanup happens in the
    /// monitor once the process reports its exit.
    pub async fn close_tunnel(&self, id: EndpointId) -> Result<(), SupervisorError> {
        let maps = self.inner.maps.read().await;
        match maps.vpns.get(&id) {
            None => Ok(()),
            Some(control) => control.close().await.map_err(Into::into),
        }
    }

    pub async fn has_tunnel(&self, id: EndpointId) -> bool {
        self.inner.maps.read().await.vpns.contains_key(&id)
    }

    /// Ids of every currently supervised tunnel.
    pub async fn tunnel_ids(&self) -> Vec<EndpointId> {
        self.inner.maps.read().await.vpns.keys().copied().collect()
    }

    /// Drive one tunnel's state stream to completion, keeping the maps and
    /// the published snapshot in step. Terminates when the process reports
    /// [`VpnState::Exited`], at which point the tunnel has been removed
    /// from the maps.
    async fn monitor_tunnel(self, id: EndpointId, mut events: VpnEvents) {
        loop {
            let state = events.await_state_change().await;
            debug!("tunnel to endpoint {id} changed state to {state}");

            {
                let mut maps = self.inner.maps.write().await;
                if state == VpnState::Exited {
                    maps.vpns.remove(&id);
                    maps.states.remove(&id);
                } else {
                    maps.states.insert(id, state);
                }
                // Publish before releasing the lock so snapshots leave in
                // exactly lock-acquisition order.
                let snapshot = TunnelsState::from_states(&maps.states);
                self.inner.change_tx.send_replace(snapshot);
            }

            if state == VpnState::Exited {
                return;
            }
        }
    }
}
