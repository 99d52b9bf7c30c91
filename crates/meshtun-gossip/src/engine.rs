//! SWIM-flavored membership engine
//!
//! One UDP socket per node. Liveness comes from direct probe/ack exchanges,
//! membership spreads through periodic full-table pushes, and disagreements
//! are settled by per-member incarnation numbers. Round-trip samples from
//! probes feed the node's network coordinate.

use std::collections::HashMap;
use std::net::{Ipv4Addr, SocketAddr};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::seq::SliceRandom;
use rand::Rng;
use tokio::net::{lookup_host, UdpSocket};
use tokio::sync::{mpsc, watch, Mutex, RwLock};
use tokio::time::sleep;
use tracing::{debug, trace, warn};

use meshtun_cluster::{Member, MemberStatus, NetworkCoordinate};

use crate::wire::{GossipMessage, Sealer};
use crate::GossipError;

const MAX_DATAGRAM: usize = 64 * 1024;

/// Timing and fanout knobs. The defaults suit a WAN mesh of tens of nodes;
/// tests shrink them to keep wall-clock time down.
#[derive(Debug, Clone)]
pub struct Tuning {
    /// How often to probe one peer for liveness.
    pub probe_interval: Duration,
    /// How often to push the member table to a few peers.
    pub gossip_interval: Duration,
    /// Silence longer than this marks an alive peer failed.
    pub suspicion_timeout: Duration,
    /// How long a leaving peer lingers before being marked left.
    pub leave_grace: Duration,
    /// Number of peers each table push goes to.
    pub fanout: usize,
    /// Quiet window over which membership changes are batched into one
    /// cluster state emission.
    pub coalesce: Duration,
}

impl Default for Tuning {
    fn default() -> Self {
        Tuning {
            probe_interval: Duration::from_secs(1),
            gossip_interval: Duration::from_secs(3),
            suspicion_timeout: Duration::from_secs(5),
            leave_grace: Duration::from_secs(6),
            fanout: 3,
            coalesce: Duration::from_secs(1),
        }
    }
}

/// Engine configuration.
#[derive(Debug, Clone)]
pub struct MembershipConfig {
    /// Cluster-unique node name.
    pub node_name: String,
    /// Local address to bind the gossip socket on.
    pub bind_addr: Ipv4Addr,
    /// Address advertised to peers (the public address when NATed).
    pub advertise_addr: Ipv4Addr,
    /// UDP port, both bound and advertised.
    pub port: u16,
    /// Tags spread with our member record.
    pub tags: HashMap<String, String>,
    /// Pool key; empty disables datagram sealing.
    pub encryption_key: String,
    pub tuning: Tuning,
}

struct Entry {
    member: Member,
    last_heard: Instant,
}

struct ProbeSent {
    name: String,
    at: Instant,
}

struct Inner {
    config: MembershipConfig,
    sealer: Sealer,
    socket: UdpSocket,
    incarnation: AtomicU64,
    status: RwLock<MemberStatus>,
    peers: RwLock<HashMap<String, Entry>>,
    coords: RwLock<HashMap<String, NetworkCoordinate>>,
    own_coord: RwLock<NetworkCoordinate>,
    pending_probes: Mutex<HashMap<u64, ProbeSent>>,
    probe_seq: AtomicU64,
    changes_tx: mpsc::Sender<()>,
    shutdown: watch::Sender<bool>,
}

/// Handle to a running (or about to run) membership engine.
#[derive(Clone)]
pub struct Membership {
    inner: Arc<Inner>,
}

impl Membership {
    /// Bind the gossip socket. Returns the engine plus the channel on which
    /// membership changes are signalled (one unit per batch of changes).
    pub async fn bind(
        config: MembershipConfig,
    ) -> Result<(Membership, mpsc::Receiver<()>), GossipError> {
        let mut config = config;
        let socket = UdpSocket::bind((config.bind_addr, config.port))
            .await
            .map_err(|e| GossipError::Bind {
                addr: format!("{}:{}", config.bind_addr, config.port),
                source: e,
            })?;
        // Port 0 means "pick one"; advertise whatever we actually got.
        if config.port == 0 {
            config.port = socket
                .local_addr()
                .map_err(|e| GossipError::Bind {
                    addr: config.bind_addr.to_string(),
                    source: e,
                })?
                .port();
        }

        let sealer = Sealer::new(&config.encryption_key);
        if !sealer.is_sealing() {
            warn!("gossip encryption key is empty; membership traffic is in the clear");
        }

        let (changes_tx, changes_rx) = mpsc::channel(1);
        let (shutdown, _) = watch::channel(false);

        let inner = Arc::new(Inner {
            config,
            sealer,
            socket,
            incarnation: AtomicU64::new(0),
            status: RwLock::new(MemberStatus::Alive),
            peers: RwLock::new(HashMap::new()),
            coords: RwLock::new(HashMap::new()),
            own_coord: RwLock::new(NetworkCoordinate::default()),
            pending_probes: Mutex::new(HashMap::new()),
            probe_seq: AtomicU64::new(0),
            changes_tx,
            shutdown,
        });

        Ok((Membership { inner }, changes_rx))
    }

    /// Spawn the receive, probe and push loops. They run until
    /// [`Membership::shutdown`].
    pub fn start(&self) {
        let recv = self.clone();
        tokio::spawn(async move { recv.recv_loop().await });

        let probe = self.clone();
        tokio::spawn(async move { probe.probe_loop().await });

        let push = self.clone();
        tokio::spawn(async move { push.push_loop().await });
    }

    pub fn shutdown(&self) {
        self.inner.shutdown.send_replace(true);
    }

    /// A receiver that resolves once [`Membership::shutdown`] is called.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.inner.shutdown.subscribe()
    }

    /// The UDP port the engine is actually bound to.
    pub fn local_port(&self) -> u16 {
        self.inner.config.port
    }

    /// Our own member record as peers should see it.
    pub async fn local_member(&self) -> Member {
        let config = &self.inner.config;
        Member {
            name: config.node_name.clone(),
            addr: config.advertise_addr,
            port: config.port,
            status: *self.inner.status.read().await,
            incarnation: self.inner.incarnation.load(Ordering::SeqCst),
            tags: config.tags.clone(),
        }
    }

    /// Every known member, ourselves included.
    pub async fn members(&self) -> Vec<Member> {
        let mut out = vec![self.local_member().await];
        let peers = self.inner.peers.read().await;
        out.extend(peers.values().map(|e| e.member.clone()));
        out
    }

    /// The most recent coordinate gossiped by `name`, or our own.
    pub async fn cached_coordinate(&self, name: &str) -> Option<NetworkCoordinate> {
        if name == self.inner.config.node_name {
            return Some(self.inner.own_coord.read().await.clone());
        }
        self.inner.coords.read().await.get(name).cloned()
    }

    /// Snapshot of every cached coordinate, keyed by node name.
    pub async fn coordinates(&self) -> HashMap<String, NetworkCoordinate> {
        let mut out = self.inner.coords.read().await.clone();
        out.insert(
            self.inner.config.node_name.clone(),
            self.inner.own_coord.read().await.clone(),
        );
        out
    }

    /// Contact seed peers ("host:port") to merge into an existing pool.
    /// Returns how many seeds were successfully contacted; an error only if
    /// every seed failed.
    pub async fn join(&self, seeds: &[String]) -> Result<usize, GossipError> {
        let mut contacted = 0;
        let mut last_err = None;

        let sync = GossipMessage::Sync {
            from: self.local_member().await,
            members: self.members().await,
        };

        for seed in seeds {
            let addr = match lookup_host(seed.as_str()).await {
                Ok(mut addrs) => match addrs.find(|a| a.is_ipv4()) {
                    Some(addr) => addr,
                    None => {
                        last_err = Some(GossipError::Resolve(seed.clone()));
                        continue;
                    }
                },
                Err(_) => {
                    last_err = Some(GossipError::Resolve(seed.clone()));
                    continue;
                }
            };

            match self.send(&sync, addr).await {
                Ok(()) => contacted += 1,
                Err(e) => {
                    debug!("failed to contact seed {seed}: {e}");
                    last_err = Some(e);
                }
            }
        }

        if contacted == 0 {
            if let Some(err) = last_err {
                return Err(err);
            }
        }
        Ok(contacted)
    }

    /// Announce a graceful departure to the pool.
    pub async fn leave(&self) {
        {
            let mut status = self.inner.status.write().await;
            *status = MemberStatus::Leaving;
        }
        let msg = GossipMessage::Leave {
            name: self.inner.config.node_name.clone(),
            incarnation: self.inner.incarnation.load(Ordering::SeqCst),
        };

        for target in self.alive_peer_addrs().await {
            if let Err(e) = self.send(&msg, target).await {
                debug!("failed to send leave to {target}: {e}");
            }
        }
    }

    async fn alive_peer_addrs(&self) -> Vec<SocketAddr> {
        let peers = self.inner.peers.read().await;
        peers
            .values()
            .filter(|e| e.member.status == MemberStatus::Alive)
            .map(|e| SocketAddr::from((e.member.addr, e.member.port)))
            .collect()
    }

    async fn send(&self, msg: &GossipMessage, to: SocketAddr) -> Result<(), GossipError> {
        let frame = self.inner.sealer.seal(msg)?;
        self.inner
            .socket
            .send_to(&frame, to)
            .await
            .map_err(GossipError::Send)?;
        Ok(())
    }

    fn notify_change(&self) {
        // Capacity-one channel: a pending notification already covers us.
        let _ = self.inner.changes_tx.try_send(());
    }

    async fn recv_loop(self) {
        let mut shutdown = self.inner.shutdown.subscribe();
        let mut buf = vec![0u8; MAX_DATAGRAM];

        loop {
            tokio::select! {
                _ = shutdown.changed() => return,
                recv = self.inner.socket.recv_from(&mut buf) => {
                    let (len, from) = match recv {
                        Ok(ok) => ok,
                        Err(e) => {
                            warn!("gossip socket receive error: {e}");
                            continue;
                        }
                    };
                    let msg = match self.inner.sealer.unseal(&buf[..len]) {
                        Ok(msg) => msg,
                        Err(e) => {
                            debug!("dropping bad datagram from {from}: {e}");
                            continue;
                        }
                    };
                    self.handle_message(msg, from).await;
                }
            }
        }
    }

    async fn handle_message(&self, msg: GossipMessage, from_addr: SocketAddr) {
        match msg {
            GossipMessage::Ping { seq, from, coordinate } => {
                trace!("ping {seq} from {}", from.name);
                let mut changed = self.direct_contact(&from).await;
                changed |= self.store_coordinate(&from.name, coordinate).await;

                let ack = GossipMessage::Ack {
                    seq,
                    from: self.local_member().await,
                    coordinate: self.inner.own_coord.read().await.clone(),
                };
                if let Err(e) = self.send(&ack, from_addr).await {
                    debug!("failed to ack ping from {from_addr}: {e}");
                }
                if changed {
                    self.notify_change();
                }
            }

            GossipMessage::Ack { seq, from, coordinate } => {
                let sent = self.inner.pending_probes.lock().await.remove(&seq);
                if let Some(sent) = sent {
                    if sent.name == from.name {
                        let rtt = sent.at.elapsed().as_secs_f64();
                        let mut own = self.inner.own_coord.write().await;
                        own.observe_rtt(rtt, &coordinate);
                    }
                }
                let mut changed = self.direct_contact(&from).await;
                changed |= self.store_coordinate(&from.name, coordinate).await;
                if changed {
                    self.notify_change();
                }
            }

            GossipMessage::Sync { from, members } => {
                let mut changed = self.direct_contact(&from).await;
                for member in members {
                    changed |= self.merge(member).await;
                }
                if changed {
                    self.notify_change();
                }
            }

            GossipMessage::Leave { name, incarnation } => {
                if name == self.inner.config.node_name {
                    return;
                }
                let mut peers = self.inner.peers.write().await;
                if let Some(entry) = peers.get_mut(&name) {
                    if incarnation >= entry.member.incarnation
                        && entry.member.status == MemberStatus::Alive
                    {
                        debug!("{name} is leaving the pool");
                        entry.member.status = MemberStatus::Leaving;
                        entry.member.incarnation = incarnation;
                        drop(peers);
                        self.notify_change();
                    }
                }
            }
        }
    }

    /// We heard from this member directly, which proves it is up no matter
    /// what rumors say. Returns whether anything observable changed.
    async fn direct_contact(&self, member: &Member) -> bool {
        if member.name == self.inner.config.node_name {
            return false;
        }

        let mut peers = self.inner.peers.write().await;
        match peers.get_mut(&member.name) {
            None => {
                debug!("{} joined the pool", member.name);
                let mut record = member.clone();
                record.status = MemberStatus::Alive;
                peers.insert(
                    member.name.clone(),
                    Entry {
                        member: record,
                        last_heard: Instant::now(),
                    },
                );
                true
            }
            Some(entry) => {
                entry.last_heard = Instant::now();
                let mut changed = false;
                if entry.member.status != MemberStatus::Alive {
                    // Resurrect with a bumped incarnation so the good news
                    // outweighs the stale rumor everywhere else too.
                    debug!("{} is back from {}", member.name, entry.member.status);
                    entry.member.status = MemberStatus::Alive;
                    entry.member.incarnation =
                        entry.member.incarnation.max(member.incarnation) + 1;
                    changed = true;
                }
                if entry.member.tags != member.tags || entry.member.addr != member.addr {
                    entry.member.tags = member.tags.clone();
                    entry.member.addr = member.addr;
                    entry.member.port = member.port;
                    changed = true;
                }
                changed
            }
        }
    }

    /// Merge one rumored member record. Higher incarnation wins; at equal
    /// incarnation the more terminal status wins, so a failure report is not
    /// erased by a stale alive record.
    async fn merge(&self, member: Member) -> bool {
        if member.name == self.inner.config.node_name {
            // A rumor that we are gone must be refuted with a fresher
            // incarnation.
            if member.status != MemberStatus::Alive {
                let mine = self.inner.incarnation.load(Ordering::SeqCst);
                if member.incarnation >= mine {
                    self.inner
                        .incarnation
                        .store(member.incarnation + 1, Ordering::SeqCst);
                    debug!(
                        "refuting rumor that we are {}; incarnation now {}",
                        member.status,
                        member.incarnation + 1
                    );
                }
            }
            return false;
        }

        let mut peers = self.inner.peers.write().await;
        match peers.get_mut(&member.name) {
            None => {
                debug!("learned about {} ({})", member.name, member.status);
                peers.insert(
                    member.name.clone(),
                    Entry {
                        member,
                        last_heard: Instant::now(),
                    },
                );
                true
            }
            Some(entry) => {
                let newer = member.incarnation > entry.member.incarnation;
                let more_terminal = member.incarnation == entry.member.incarnation
                    && status_rank(member.status) > status_rank(entry.member.status);
                if !(newer || more_terminal) {
                    return false;
                }
                let changed = entry.member.status != member.status
                    || entry.member.tags != member.tags
                    || entry.member.addr != member.addr;
                if changed && entry.member.status != member.status {
                    debug!(
                        "{} moved from {} to {}",
                        member.name, entry.member.status, member.status
                    );
                }
                entry.member = member;
                changed
            }
        }
    }

    async fn store_coordinate(&self, name: &str, coordinate: NetworkCoordinate) -> bool {
        let mut coords = self.inner.coords.write().await;
        let had = coords.contains_key(name);
        coords.insert(name.to_string(), coordinate);
        // Only the first coordinate for a peer changes distance ordering in
        // a way worth waking the consumer for; later refinements are picked
        // up by the periodic reconcile tick.
        !had
    }

    async fn probe_loop(self) {
        let mut shutdown = self.inner.shutdown.subscribe();
        let tuning = self.inner.config.tuning.clone();

        loop {
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = sleep(tuning.probe_interval) => {}
            }

            self.expire_probes(tuning.probe_interval * 3).await;
            if self.sweep_statuses(&tuning).await {
                self.notify_change();
            }

            let target = {
                let peers = self.inner.peers.read().await;
                let candidates: Vec<_> = peers
                    .values()
                    .filter(|e| e.member.status == MemberStatus::Alive)
                    .map(|e| {
                        (
                            e.member.name.clone(),
                            SocketAddr::from((e.member.addr, e.member.port)),
                        )
                    })
                    .collect();
                candidates.choose(&mut rand::thread_rng()).cloned()
            };

            let Some((name, addr)) = target else { continue };

            let seq = self.inner.probe_seq.fetch_add(1, Ordering::SeqCst);
            self.inner.pending_probes.lock().await.insert(
                seq,
                ProbeSent {
                    name: name.clone(),
                    at: Instant::now(),
                },
            );

            let ping = GossipMessage::Ping {
                seq,
                from: self.local_member().await,
                coordinate: self.inner.own_coord.read().await.clone(),
            };
            if let Err(e) = self.send(&ping, addr).await {
                debug!("failed to probe {name}: {e}");
            }
        }
    }

    async fn expire_probes(&self, older_than: Duration) {
        let mut pending = self.inner.pending_probes.lock().await;
        pending.retain(|_, sent| sent.at.elapsed() < older_than);
    }

    /// Apply time-based status transitions: silent alive peers fail, leaving
    /// peers complete their departure.
    async fn sweep_statuses(&self, tuning: &Tuning) -> bool {
        let mut changed = false;
        let mut peers = self.inner.peers.write().await;
        for entry in peers.values_mut() {
            match entry.member.status {
                MemberStatus::Alive => {
                    if entry.last_heard.elapsed() > tuning.suspicion_timeout {
                        debug!("{} went silent, marking failed", entry.member.name);
                        entry.member.status = MemberStatus::Failed;
                        changed = true;
                    }
                }
                MemberStatus::Leaving => {
                    if entry.last_heard.elapsed() > tuning.leave_grace {
                        debug!("{} has left", entry.member.name);
                        entry.member.status = MemberStatus::Left;
                        changed = true;
                    }
                }
                _ => {}
            }
        }
        changed
    }

    async fn push_loop(self) {
        let mut shutdown = self.inner.shutdown.subscribe();
        let tuning = self.inner.config.tuning.clone();

        loop {
            // Jitter the push period so a fleet started together does not
            // synchronize its bursts.
            let jitter = rand::thread_rng().gen_range(0..250);
            let period = tuning.gossip_interval + Duration::from_millis(jitter);
            tokio::select! {
                _ = shutdown.changed() => return,
                _ = sleep(period) => {}
            }

            let targets = {
                let mut addrs = self.alive_peer_addrs().await;
                addrs.shuffle(&mut rand::thread_rng());
                addrs.truncate(tuning.fanout);
                addrs
            };
            if targets.is_empty() {
                continue;
            }

            let sync = GossipMessage::Sync {
                from: self.local_member().await,
                members: self.members().await,
            };
            for addr in targets {
                if let Err(e) = self.send(&sync, addr).await {
                    debug!("failed to push members to {addr}: {e}");
                }
            }
        }
    }
}

fn status_rank(status: MemberStatus) -> u8 {
    match status {
        MemberStatus::Unknown => 0,
        MemberStatus::Alive => 1,
        MemberStatus::Leaving => 2,
        MemberStatus::Failed => 3,
        MemberStatus::Left => 4,
    }
}
