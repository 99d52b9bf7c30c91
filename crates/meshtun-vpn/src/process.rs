//! Launching and babysitting one OpenVPN child process

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::net::UnixListener;
use tokio::process::Command;
use tokio::sync::{mpsc, oneshot};
use tokio::time::sleep;
use tracing::{debug, info, warn};

use crate::mgmt::{MgmtClient, MgmtEvent};
use crate::{TunnelControl, TunnelLauncher, TunnelSpec, VpnError, VpnEvents, VpnState};

/// How long the child gets to connect to the management socket.
const STARTUP_TIMEOUT: Duration = Duration::from_secs(10);

/// Launches OpenVPN children for tunnel specs.
pub struct OpenVpnLauncher {
    openvpn_path: PathBuf,
    /// Optional indirection, in practice either absent or a path to sudo.
    launcher_path: Option<PathBuf>,
    /// Pre-shared key file. Every endpoint must use the same key; a
    /// suitable file comes from `openvpn --genkey --secret secret.key`.
    secret_file: PathBuf,
    /// Accept peer datagrams from any source address. Useful when several
    /// nodes share one development machine, a bad idea on the internet.
    allow_float: bool,
}

impl OpenVpnLauncher {
    pub fn new(
        openvpn_path: PathBuf,
        launcher_path: Option<PathBuf>,
        secret_file: PathBuf,
        allow_float: bool,
    ) -> OpenVpnLauncher {
        OpenVpnLauncher {
            openvpn_path,
            launcher_path,
            secret_file,
            allow_float,
        }
    }
}

#[async_trait]
impl TunnelLauncher for OpenVpnLauncher {
    async fn launch(&self, spec: TunnelSpec) -> Result<VpnProcess, VpnError> {
        start_openvpn(self, &spec).await
    }
}

/// A launched tunnel process: a shutdown handle plus the ordered stream of
/// its state changes.
pub struct VpnProcess {
    control: Box<dyn TunnelControl>,
    events: VpnEvents,
}

impl VpnProcess {
    /// Assemble a process handle from parts. Production code goes through
    /// [`OpenVpnLauncher`]; this exists so tests can substitute scripted
    /// processes.
    pub fn new(control: Box<dyn TunnelControl>, events: VpnEvents) -> VpnProcess {
        VpnProcess { control, events }
    }

    pub fn into_parts(self) -> (Box<dyn TunnelControl>, VpnEvents) {
        (self.control, self.events)
    }
}

struct OpenVpnControl {
    client: MgmtClient,
    pid: Option<i32>,
}

#[async_trait]
impl TunnelControl for OpenVpnControl {
    async fn close(&self) -> Result<(), VpnError> {
        self.client.send_signal("SIGTERM").await
    }

    fn force_close(&self) -> Result<(), VpnError> {
        match self.pid {
            Some(pid) => kill(Pid::from_raw(pid), Signal::SIGKILL).map_err(VpnError::Kill),
            None => Ok(()),
        }
    }
}

/// Launch OpenVPN and return once it has connected to its management
/// socket, ready to be driven.
///
/// Coordinating the startup sequence is the hairy part: the management
/// accept, the child's own exit and a hard timeout all race, and no branch
/// may leave a dangling child, task or socket behind. The child waiter task
/// doubles as the long-term process reaper, so it stays behind on success
/// on purpose; the temp socket directory is removed on every path (once the
/// child has connected, the directory entry is no longer needed).
async fn start_openvpn(
    launcher: &OpenVpnLauncher,
    spec: &TunnelSpec,
) -> Result<VpnProcess, VpnError> {
    let socket_dir = tempfile::tempdir().map_err(VpnError::SocketDir)?;
    let socket_path = socket_dir.path().join("mgmt.sock");
    let listener = UnixListener::bind(&socket_path).map_err(VpnError::MgmtSocket)?;

    let args = command_line(launcher, spec, &socket_path);
    info!("starting {}", args.join(" "));

    let mut command = Command::new(&args[0]);
    command
        .args(&args[1..])
        .env_clear()
        .current_dir(socket_dir.path())
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());

    let mut child = command.spawn().map_err(VpnError::Spawn)?;
    let pid = child.id().map(|pid| pid as i32);

    // The reaper owns the child for its whole lifetime. During startup its
    // report is raced against the management accept; afterwards nobody
    // listens and it just logs the eventual exit, however many days out.
    let (exit_tx, exit_rx) = oneshot::channel();
    tokio::spawn(async move {
        let status = child.wait().await;
        match &status {
            Ok(status) => debug!("openvpn process exited: {status}"),
            Err(e) => warn!("failed to await openvpn process: {e}"),
        }
        let _ = exit_tx.send(status);
    });

    let stream = tokio::select! {
        accepted = listener.accept() => match accepted {
            Ok((stream, _)) => stream,
            Err(e) => {
                kill_quietly(pid);
                return Err(VpnError::MgmtAccept(e));
            }
        },
        exited = exit_rx => {
            return Err(match exited {
                Ok(Ok(status)) => VpnError::ExitedEarly(status.to_string()),
                Ok(Err(e)) => VpnError::ExitedEarly(e.to_string()),
                Err(_) => VpnError::ExitedEarly("exit status lost".to_string()),
            });
        }
        _ = sleep(STARTUP_TIMEOUT) => {
            // The reaper is still blocked on the child and will drain it
            // once the kill lands.
            kill_quietly(pid);
            return Err(VpnError::StartupTimeout);
        }
    };

    let (client, event_rx) = MgmtClient::open(stream);
    if let Err(e) = client.enable_state_events().await {
        kill_quietly(pid);
        return Err(e);
    }

    // From here on the management socket is the liveness signal: the
    // process going away closes it, which ends the event stream, which
    // makes the monitor emit the terminal state.
    let (state_tx, state_rx) = mpsc::channel(1);
    tokio::spawn(monitor(client.clone(), event_rx, state_tx));

    Ok(VpnProcess {
        control: Box::new(OpenVpnControl { client, pid }),
        events: VpnEvents::new(state_rx),
    })
}

/// Translate management events into tunnel states until the event stream
/// ends, then report the terminal state and hang up.
async fn monitor(
    client: MgmtClient,
    mut events: mpsc::Receiver<MgmtEvent>,
    states: mpsc::Sender<VpnState>,
) {
    // The first send parks until a consumer starts reading, so no state
    // can slip by between construction and the first await.
    if states.send(VpnState::Launching).await.is_err() {
        return;
    }

    // The process is already on its first connection attempt by the time
    // we are pumping events.
    let mut connect_tries: u32 = 1;
    if states.send(VpnState::Connecting).await.is_err() {
        return;
    }

    while let Some(event) = events.recv().await {
        match event {
            MgmtEvent::Hold(_) => {
                if let Err(e) = client.hold_release().await {
                    warn!("failed to release management hold: {e}");
                }
            }
            MgmtEvent::State(state) => {
                let name = state.new_state();
                debug!("openvpn process moved to state {name}");
                if let Some(new_state) = translate_state(name, &mut connect_tries) {
                    if states.send(new_state).await.is_err() {
                        return;
                    }
                }
            }
            _ => {}
        }
    }

    let _ = states.send(VpnState::Exited).await;
}

fn translate_state(name: &str, connect_tries: &mut u32) -> Option<VpnState> {
    match name {
        "CONNECTING" | "RECONNECTING" => {
            let state = if *connect_tries > 0 {
                VpnState::Retrying
            } else {
                VpnState::Connecting
            };
            *connect_tries += 1;
            Some(state)
        }
        "CONNECTED" => {
            *connect_tries = 0;
            Some(VpnState::Connected)
        }
        "EXITING" => Some(VpnState::Exiting),
        _ => None,
    }
}

fn command_line(launcher: &OpenVpnLauncher, spec: &TunnelSpec, socket_path: &Path) -> Vec<String> {
    let mut args: Vec<String> = Vec::with_capacity(32);

    if let Some(indirect) = &launcher.launcher_path {
        args.push(indirect.display().to_string());
        args.push("--".to_string());
    }
    args.push(launcher.openvpn_path.display().to_string());

    if launcher.allow_float {
        args.push("--float".to_string());
    }

    // Connect to our management socket and hold until we are actively
    // pumping the event stream.
    args.push("--management-client".to_string());
    args.push("--management".to_string());
    args.push(socket_path.display().to_string());
    args.push("unix".to_string());
    args.push("--management-hold".to_string());

    args.push("--secret".to_string());
    args.push(launcher.secret_file.display().to_string());

    args.push("--dev".to_string());
    args.push("tun".to_string());
    args.push("--local".to_string());
    args.push(spec.local_addr.ip().to_string());
    args.push("--port".to_string());
    args.push(spec.local_addr.port().to_string());
    args.push("--remote".to_string());
    args.push(spec.remote_addr.ip().to_string());
    args.push(spec.remote_addr.port().to_string());
    args.push("--ifconfig".to_string());
    args.push(spec.tunnel_local_ip.to_string());
    args.push(spec.tunnel_remote_ip.to_string());

    // Ping every 15 seconds, declare the tunnel dead after 30 of silence.
    // A caller treating Retrying as critical therefore gives a tunnel
    // about a minute to recover before paging anyone, and a dead tunnel
    // can eat packets for up to 30 seconds before rerouting kicks in.
    args.push("--keepalive".to_string());
    args.push("15".to_string());
    args.push("30".to_string());

    args
}

fn kill_quietly(pid: Option<i32>) {
    if let Some(pid) = pid {
        let _ = kill(Pid::from_raw(pid), Signal::SIGKILL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, SocketAddrV4};

    use meshtun_addressing::EndpointId;

    fn spec() -> TunnelSpec {
        TunnelSpec {
            endpoint_id: EndpointId::from_raw(0x007),
            local_addr: SocketAddrV4::new(Ipv4Addr::new(10, 5, 0, 1), 1199),
            remote_addr: SocketAddrV4::new(Ipv4Addr::new(203, 0, 113, 7), 1201),
            tunnel_local_ip: Ipv4Addr::new(172, 16, 20, 7),
            tunnel_remote_ip: Ipv4Addr::new(172, 16, 28, 5),
        }
    }

    #[test]
    fn command_line_direct() {
        let launcher = OpenVpnLauncher::new(
            PathBuf::from("/usr/sbin/openvpn"),
            None,
            PathBuf::from("/etc/meshtun/secret.key"),
            false,
        );
        let args = command_line(&launcher, &spec(), Path::new("/tmp/x/mgmt.sock"));

        assert_eq!(args[0], "/usr/sbin/openvpn");
        assert!(!args.contains(&"--float".to_string()));
        assert!(!args.contains(&"--".to_string()));

        let joined = args.join(" ");
        assert!(joined.contains("--management /tmp/x/mgmt.sock unix"));
        assert!(joined.contains("--management-hold"));
        assert!(joined.contains("--local 10.5.0.1 --port 1199"));
        assert!(joined.contains("--remote 203.0.113.7 1201"));
        assert!(joined.contains("--ifconfig 172.16.20.7 172.16.28.5"));
        assert!(joined.contains("--keepalive 15 30"));
    }

    #[test]
    fn command_line_with_launcher_and_float() {
        let launcher = OpenVpnLauncher::new(
            PathBuf::from("/usr/sbin/openvpn"),
            Some(PathBuf::from("/usr/bin/sudo")),
            PathBuf::from("/etc/meshtun/secret.key"),
            true,
        );
        let args = command_line(&launcher, &spec(), Path::new("/tmp/x/mgmt.sock"));

        assert_eq!(args[0], "/usr/bin/sudo");
        assert_eq!(args[1], "--");
        assert_eq!(args[2], "/usr/sbin/openvpn");
        assert!(args.contains(&"--float".to_string()));
    }

    #[test]
    fn state_translation_warning_versus_critical() {
        let mut tries = 1;

        // The first management CONNECTING lands while we already count one
        // attempt in flight, so it reads as a retry.
        assert_eq!(
            translate_state("CONNECTING", &mut tries),
            Some(VpnState::Retrying)
        );
        assert_eq!(
            translate_state("CONNECTED", &mut tries),
            Some(VpnState::Connected)
        );
        assert_eq!(tries, 0);

        // First reconnect after an established tunnel is only a warning.
        assert_eq!(
            translate_state("RECONNECTING", &mut tries),
            Some(VpnState::Connecting)
        );
        // Sustained failure turns critical.
        assert_eq!(
            translate_state("RECONNECTING", &mut tries),
            Some(VpnState::Retrying)
        );
        assert_eq!(
            translate_state("RECONNECTING", &mut tries),
            Some(VpnState::Retrying)
        );

        // States we do not track produce no emission.
        assert_eq!(translate_state("WAIT", &mut tries), None);
        assert_eq!(translate_state("EXITING", &mut tries), Some(VpnState::Exiting));
    }
}
