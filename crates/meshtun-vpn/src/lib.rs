//! Tunnel process supervision
//!
//! One OpenVPN child process per peer tunnel. [`VpnProcess`] launches and
//! babysits a single child through its management socket;
//! [`TunnelSupervisor`] owns the set of live tunnels and publishes a fresh
//! [`TunnelsState`] snapshot on every per-process state change.

use std::fmt;
use std::net::{Ipv4Addr, SocketAddrV4};

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

use meshtun_addressing::EndpointId;

pub mod mgmt;
mod process;
mod supervisor;

pub use process::{OpenVpnLauncher, VpnProcess};
pub use supervisor::{SupervisorError, Tunnel, TunnelSupervisor, TunnelsState};

/// Tunnel process errors.
#[derive(Debug, Error)]
pub enum VpnError {
    #[error("failed to create temp dir for management socket: {0}")]
    SocketDir(std::io::Error),

    #[error("failed to open management socket: {0}")]
    MgmtSocket(std::io::Error),

    #[error("openvpn failed to start: {0}")]
    Spawn(std::io::Error),

    #[error("error awaiting management connection: {0}")]
    MgmtAccept(std::io::Error),

    #[error("openvpn exited prematurely ({0})")]
    ExitedEarly(String),

    #[error("timeout waiting for openvpn to start up")]
    StartupTimeout,

    #[error("management channel i/o error: {0}")]
    MgmtIo(std::io::Error),

    #[error("management command {command:?} failed: {message}")]
    MgmtCommand { command: String, message: String },

    #[error("management connection closed")]
    MgmtClosed,

    #[error("failed to signal openvpn process: {0}")]
    Kill(nix::Error),
}

/// Connection state of one tunnel process.
///
/// `Connecting` is the first attempt at dialing (or the first attempt after
/// a disconnect) and is a warning-level condition; `Retrying` means at least
/// one attempt has already failed and is critical-level. Intermittent
/// disconnects are normal on the open internet, sustained failure is what
/// outside monitoring needs to see.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VpnState {
    /// Process launched, not yet dialing its peer.
    Launching,
    Connecting,
    Retrying,
    /// The tunnel is up and passing traffic.
    Connected,
    /// The process is shutting down; `Exited` follows shortly.
    Exiting,
    /// Terminal. Always the last state a tunnel reports.
    Exited,
}

impl fmt::Display for VpnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            VpnState::Launching => "launching",
            VpnState::Connecting => "connecting",
            VpnState::Retrying => "retrying",
            VpnState::Connected => "connected",
            VpnState::Exiting => "exiting",
            VpnState::Exited => "exited",
        };
        f.write_str(s)
    }
}

/// Everything a launcher needs to bring up one tunnel, all derived from the
/// addressing algebra by the supervisor.
#[derive(Debug, Clone)]
pub struct TunnelSpec {
    pub endpoint_id: EndpointId,
    /// Where our side of the tunnel listens.
    pub local_addr: SocketAddrV4,
    /// The peer's public address and derived port.
    pub remote_addr: SocketAddrV4,
    pub tunnel_local_ip: Ipv4Addr,
    pub tunnel_remote_ip: Ipv4Addr,
}

/// Shutdown handle for a running tunnel process.
#[async_trait]
pub trait TunnelControl: Send + Sync {
    /// Ask the process to shut down cleanly. Callers must keep draining
    /// state changes until [`VpnState::Exited`].
    async fn close(&self) -> Result<(), VpnError>;

    /// Terminate the process abruptly. Same draining requirement.
    fn force_close(&self) -> Result<(), VpnError>;
}

/// Launches tunnel processes. The production implementation is
/// [`OpenVpnLauncher`]; tests substitute scripted fakes.
#[async_trait]
pub trait TunnelLauncher: Send + Sync + 'static {
    async fn launch(&self, spec: TunnelSpec) -> Result<VpnProcess, VpnError>;
}

/// Ordered stream of state changes for one tunnel process.
pub struct VpnEvents {
    rx: mpsc::Receiver<VpnState>,
}

impl VpnEvents {
    pub fn new(rx: mpsc::Receiver<VpnState>) -> VpnEvents {
        VpnEvents { rx }
    }

    /// Block until the process changes state and return the new state.
    ///
    /// Must be called continuously for the lifetime of the process; event
    /// processing stalls otherwise. Once the process is gone this returns
    /// [`VpnState::Exited`] immediately, forever.
    pub async fn await_state_change(&mut self) -> VpnState {
        self.rx.recv().await.unwrap_or(VpnState::Exited)
    }
}
