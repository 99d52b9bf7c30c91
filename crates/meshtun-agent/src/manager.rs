//! The reconcile loop
//!
//! One loop with three wake sources: a new cluster snapshot from gossip, a
//! new tunnel snapshot from the supervisor, and a periodic tick. Each pass
//! narrows the gap between the tunnels we have and the tunnels the cluster
//! state implies. Nothing in the steady state is fatal; errors are logged
//! and the next pass tries again.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{mpsc, watch};
use tokio::time::{sleep, timeout};
use tracing::{debug, info, warn};

use meshtun_addressing::Addressing;
use meshtun_gossip::{Gossip, GossipConfig, Tuning};
use meshtun_vpn::{OpenVpnLauncher, TunnelLauncher, TunnelSupervisor, TunnelsState};

use crate::config::Config;
use crate::{netif, reconcile, status};

/// How long tunnels get to exit during shutdown before we give up and let
/// the OS reap them.
const SHUTDOWN_DRAIN_TIMEOUT: Duration = Duration::from_secs(30);

/// Owns the gossip layer and the tunnel supervisor and reconciles between
/// them.
pub struct Manager {
    config: Config,
    addressing: Addressing,
    gossip: Arc<Gossip>,
    launcher: Arc<dyn TunnelLauncher>,
}

impl Manager {
    pub async fn new(config: Config) -> Result<Manager> {
        let local_ip = netif::interface_ipv4(&config.local_interface)?;

        // The membership layer gets a reserved spot under the data dir for
        // its own snapshots.
        std::fs::create_dir_all(config.data_dir.join("serf"))
            .with_context(|| format!("failed to create {}", config.data_dir.display()))?;

        let addressing = Addressing {
            common_prefix_len: config.common_prefix_length,
            region_prefix_len: config.region_prefix_length,
            dc_prefix_len: config.datacenter_prefix_length,
            vpn_start_port: config.vpn_endpoint_start_port,
            local_ip,
        };

        let gossip = Gossip::bind(GossipConfig {
            node_name: config.node_name.clone(),
            listen_ip: local_ip,
            advertise_ip: config.public_ip()?,
            port: config.gossip_port,
            encryption_key: config.gossip_encryption_key.clone(),
            addressing,
            tuning: Tuning::default(),
        })
        .await?;

        let launcher = Arc::new(OpenVpnLauncher::new(
            config.openvpn_path.clone(),
            config.launcher_path.clone(),
            config.vpn_key_file.clone(),
            config.allow_float,
        ));

        Ok(Manager {
            config,
            addressing,
            gossip: Arc::new(gossip),
            launcher,
        })
    }

    /// Run until `shutdown` fires, then close every tunnel, wait for the
    /// processes to exit, and leave the gossip pool.
    pub async fn run(self, mut shutdown: mpsc::Receiver<()>) -> Result<()> {
        let (cluster_tx, mut cluster_rx) = mpsc::channel(1);
        let gossip_task = {
            let gossip = self.gossip.clone();
            tokio::spawn(async move { gossip.start(cluster_tx).await })
        };

        // Wait for the initial snapshot so the membership engine is up
        // before we try to join anything.
        let mut cluster = cluster_rx
            .recv()
            .await
            .context("gossip layer stopped before producing a cluster state")?;

        // Contacting our own advertised address exercises the public route
        // even on a fresh pool, and raises the odds of the join landing.
        let mut seeds = self.config.initial_peers.clone();
        seeds.push(format!(
            "{}:{}",
            self.config.public_ip_address, self.config.gossip_port
        ));
        match self.gossip.join(&seeds).await {
            Ok(contacted) => info!("joined a pool by contacting {contacted} nodes"),
            // Not fatal: peers can still find us through gossip later.
            Err(e) => warn!("initial join failed: {e}"),
        }

        let (change_tx, mut tunnel_rx) = watch::channel(TunnelsState::default());
        let supervisor =
            TunnelSupervisor::new(self.addressing, self.launcher.clone(), change_tx);
        let mut tunnels = TunnelsState::default();

        let refresh = Duration::from_secs(self.config.reconcile_interval_secs);
        let mut gossip_died = false;

        loop {
            debug!("cluster state:\n{}", status::format_cluster_state(&cluster));
            debug!("tunnel state:\n{}", status::format_tunnels_state(&tunnels));

            let endpoints = reconcile::remote_endpoints_by_id(&cluster);
            let plan = reconcile::plan(&cluster, &tunnels);
            debug!(
                "reconcile: {} to start, {} to close, {} expected",
                plan.to_start.len(),
                plan.to_close.len(),
                plan.expected.len()
            );

            for id in plan.to_start.iter() {
                let Some(endpoint) = endpoints.get(&id) else {
                    continue;
                };
                if let Err(e) = supervisor.start_tunnel(endpoint).await {
                    warn!("failed to start tunnel to endpoint {id}: {e}");
                }
            }
            for id in plan.to_close.iter() {
                if let Err(e) = supervisor.close_tunnel(id).await {
                    warn!("failed to signal endpoint {id} tunnel to close: {e}");
                }
            }

            // Block until the situation changes somehow. The tick catches
            // silent drift, most importantly coordinate changes reordering
            // the closest-neighbor lists.
            tokio::select! {
                state = cluster_rx.recv() => match state {
                    Some(state) => {
                        debug!("cluster state changed");
                        cluster = state;
                    }
                    None => {
                        warn!("gossip layer stopped unexpectedly");
                        gossip_died = true;
                        break;
                    }
                },
                changed = tunnel_rx.changed() => {
                    if changed.is_ok() {
                        tunnels = tunnel_rx.borrow_and_update().clone();
                        debug!("tunnel state changed");
                    }
                }
                _ = sleep(refresh) => {
                    debug!("periodic refresh");
                }
                _ = shutdown.recv() => {
                    info!("shutdown requested");
                    break;
                }
            }
        }

        self.wind_down(&supervisor, &mut tunnel_rx).await;
        // Closing our end unparks the gossip layer if it is mid-emission, so
        // it can see the shutdown and return.
        drop(cluster_rx);
        let _ = gossip_task.await;

        if gossip_died {
            anyhow::bail!("gossip layer stopped unexpectedly");
        }
        Ok(())
    }

    /// Close every tunnel, wait for the supervisor to drain, then leave the
    /// gossip pool.
    async fn wind_down(
        &self,
        supervisor: &TunnelSupervisor,
        tunnel_rx: &mut watch::Receiver<TunnelsState>,
    ) {
        let ids = supervisor.tunnel_ids().await;
        info!("shutting down, closing {} tunnels", ids.len());
        for id in ids {
            if let Err(e) = supervisor.close_tunnel(id).await {
                warn!("failed to signal endpoint {id} tunnel to close: {e}");
            }
        }

        let drain = async {
            loop {
                if tunnel_rx.borrow_and_update().is_empty() {
                    return;
                }
                if tunnel_rx.changed().await.is_err() {
                    return;
                }
            }
        };
        if timeout(SHUTDOWN_DRAIN_TIMEOUT, drain).await.is_err() {
            warn!("tunnels did not exit in time, leaving them to the OS");
        }

        self.gossip.close().await;
    }
}
