//! Supervisor behavior driven by a scripted tunnel process

use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::timeout;

use meshtun_addressing::{Addressing, EndpointId};
use meshtun_cluster::{Endpoint, Member, MemberStatus, INTERNAL_IP_TAG};
use meshtun_vpn::{
    SupervisorError, TunnelControl, TunnelLauncher, TunnelSupervisor, TunnelsState, TunnelSpec,
    VpnError, VpnEvents, VpnProcess, VpnState,
};

fn addressing() -> Addressing {
    Addressing {
        common_prefix_len: 8,
        region_prefix_len: 12,
        dc_prefix_len: 16,
        vpn_start_port: 1194,
        local_ip: Ipv4Addr::new(10, 5, 0, 1),
    }
}

fn endpoint(name: &str, int_ip: Option<&str>) -> Endpoint {
    let mut tags = HashMap::new();
    if let Some(ip) = int_ip {
        tags.insert(INTERNAL_IP_TAG.to_string(), ip.to_string());
    }
    let member = Member {
        name: name.into(),
        addr: Ipv4Addr::new(203, 0, 113, 9),
        port: 7946,
        status: MemberStatus::Alive,
        incarnation: 0,
        tags,
    };
    Endpoint::from_member(&addressing(), &member, None)
}

struct FakeControl {
    close_tx: mpsc::Sender<()>,
}

#[async_trait]
impl TunnelControl for FakeControl {
    async fn close(&self) -> Result<(), VpnError> {
        self.close_tx.send(()).await.map_err(|_| VpnError::MgmtClosed)
    }

    fn force_close(&self) -> Result<(), VpnError> {
        Ok(())
    }
}

/// Launches scripted processes that come up, report connected, and exit
/// cleanly when asked to close.
struct FakeLauncher {
    fail_next: AtomicBool,
    launches: AtomicUsize,
    specs: Mutex<Vec<TunnelSpec>>,
}

impl FakeLauncher {
    fn new() -> Arc<FakeLauncher> {
        Arc::new(FakeLauncher {
            fail_next: AtomicBool::new(false),
            launches: AtomicUsize::new(0),
            specs: Mutex::new(Vec::new()),
        })
    }
}

#[async_trait]
impl TunnelLauncher for FakeLauncher {
    async fn launch(&self, spec: TunnelSpec) -> Result<VpnProcess, VpnError> {
        self.launches.fetch_add(1, Ordering::SeqCst);
        if self.fail_next.swap(false, Ordering::SeqCst) {
            return Err(VpnError::StartupTimeout);
        }
        self.specs.lock().await.push(spec);

        let (state_tx, state_rx) = mpsc::channel(1);
        let (close_tx, mut close_rx) = mpsc::channel::<()>(1);

        tokio::spawn(async move {
            for state in [VpnState::Launching, VpnState::Connecting, VpnState::Connected] {
                if state_tx.send(state).await.is_err() {
                    return;
                }
            }
            if close_rx.recv().await.is_some() {
                let _ = state_tx.send(VpnState::Exiting).await;
                let _ = state_tx.send(VpnState::Exited).await;
            }
        });

        Ok(VpnProcess::new(
            Box::new(FakeControl { close_tx }),
            VpnEvents::new(state_rx),
        ))
    }
}

fn supervisor(launcher: Arc<FakeLauncher>) -> (TunnelSupervisor, watch::Receiver<TunnelsState>) {
    let (change_tx, change_rx) = watch::channel(TunnelsState::default());
    (
        TunnelSupervisor::new(addressing(), launcher, change_tx),
        change_rx,
    )
}

/// Observe snapshots until one satisfies the predicate, asserting along the
/// way that no snapshot ever contains an exited tunnel.
async fn await_snapshot(
    rx: &mut watch::Receiver<TunnelsState>,
    what: &str,
    predicate: impl Fn(&TunnelsState) -> bool,
) -> TunnelsState {
    timeout(Duration::from_secs(5), async {
        loop {
            {
                let snapshot = rx.borrow_and_update().clone();
                for tunnel in snapshot.tunnels() {
                    assert_ne!(
                        tunnel.state,
                        VpnState::Exited,
                        "snapshot contained an exited tunnel"
                    );
                }
                if predicate(&snapshot) {
                    return snapshot;
                }
            }
            rx.changed().await.expect("supervisor gone");
        }
    })
    .await
    .unwrap_or_else(|_| panic!("timed out waiting for: {what}"))
}

#[tokio::test]
async fn tunnel_lifecycle_start_to_close() {
    let launcher = FakeLauncher::new();
    let (supervisor, mut rx) = supervisor(launcher.clone());

    let peer = endpoint("peer", Some("10.7.0.1"));
    let id = peer.id();
    assert_eq!(id, EndpointId::from_raw(0x007));

    supervisor.start_tunnel(&peer).await.expect("start");
    assert!(supervisor.has_tunnel(id).await);

    await_snapshot(&mut rx, "tunnel connected", |s| {
        s.state_of(id) == Some(VpnState::Connected)
    })
    .await;

    // The launch derived its endpoints from the addressing algebra.
    let specs = launcher.specs.lock().await;
    assert_eq!(specs.len(), 1);
    assert_eq!(specs[0].local_addr.port(), 1199);
    assert_eq!(specs[0].remote_addr.port(), 1201);
    assert_eq!(specs[0].tunnel_local_ip, Ipv4Addr::new(172, 16, 20, 7));
    assert_eq!(specs[0].tunnel_remote_ip, Ipv4Addr::new(172, 16, 28, 5));
    drop(specs);

    supervisor.close_tunnel(id).await.expect("close");

    await_snapshot(&mut rx, "tunnel gone", |s| s.is_empty()).await;
    assert!(!supervisor.has_tunnel(id).await);
    assert!(supervisor.tunnel_ids().await.is_empty());
}

#[tokio::test]
async fn double_start_is_rejected() {
    let launcher = FakeLauncher::new();
    let (supervisor, mut rx) = supervisor(launcher.clone());

    let peer = endpoint("peer", Some("10.7.0.1"));
    supervisor.start_tunnel(&peer).await.expect("first start");

    match supervisor.start_tunnel(&peer).await {
        Err(SupervisorError::AlreadyRunning(id)) => {
            assert_eq!(id, peer.id());
        }
        other => panic!("expected AlreadyRunning, got {other:?}"),
    }
    // Only one real launch happened.
    assert_eq!(launcher.launches.load(Ordering::SeqCst), 1);

    await_snapshot(&mut rx, "single tunnel", |s| s.tunnels().len() == 1).await;
}

#[tokio::test]
async fn failed_launch_leaves_no_trace() {
    let launcher = FakeLauncher::new();
    launcher.fail_next.store(true, Ordering::SeqCst);
    let (supervisor, rx) = supervisor(launcher.clone());

    let peer = endpoint("peer", Some("10.7.0.1"));
    match supervisor.start_tunnel(&peer).await {
        Err(SupervisorError::Vpn(VpnError::StartupTimeout)) => {}
        other => panic!("expected startup timeout, got {other:?}"),
    }

    assert!(!supervisor.has_tunnel(peer.id()).await);
    // No snapshot was published for the failed start.
    assert!(!rx.has_changed().expect("supervisor alive"));

    // The next attempt goes through; this is how the reconciler retries.
    supervisor.start_tunnel(&peer).await.expect("retry");
    assert!(supervisor.has_tunnel(peer.id()).await);
}

#[tokio::test]
async fn close_of_unknown_tunnel_is_a_noop() {
    let launcher = FakeLauncher::new();
    let (supervisor, _rx) = supervisor(launcher);

    supervisor
        .close_tunnel(EndpointId::from_raw(0x123))
        .await
        .expect("no-op close");
}

#[tokio::test]
async fn endpoint_without_id_is_rejected() {
    let launcher = FakeLauncher::new();
    let (supervisor, _rx) = supervisor(launcher.clone());

    let peer = endpoint("tagless", None);
    match supervisor.start_tunnel(&peer).await {
        Err(SupervisorError::InvalidEndpoint(name)) => assert_eq!(name, "tagless"),
        other => panic!("expected InvalidEndpoint, got {other:?}"),
    }
    assert_eq!(launcher.launches.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn two_tunnels_supervised_independently() {
    let launcher = FakeLauncher::new();
    let (supervisor, mut rx) = supervisor(launcher);

    let a = endpoint("a", Some("10.7.0.1"));
    let b = endpoint("b", Some("10.9.0.1"));
    supervisor.start_tunnel(&a).await.expect("start a");
    supervisor.start_tunnel(&b).await.expect("start b");

    let snapshot = await_snapshot(&mut rx, "both connected", |s| {
        s.state_of(a.id()) == Some(VpnState::Connected)
            && s.state_of(b.id()) == Some(VpnState::Connected)
    })
    .await;
    assert_eq!(snapshot.tunnels().len(), 2);

    // Closing one leaves the other untouched.
    supervisor.close_tunnel(a.id()).await.expect("close a");
    await_snapshot(&mut rx, "only b remains", |s| {
        s.state_of(a.id()).is_none() && s.state_of(b.id()) == Some(VpnState::Connected)
    })
    .await;
    assert!(supervisor.has_tunnel(b.id()).await);
}
