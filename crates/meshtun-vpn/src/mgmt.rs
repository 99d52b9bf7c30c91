//! OpenVPN management interface client
//!
//! Line protocol over a local-domain socket. The process pushes
//! asynchronous event lines prefixed with `>`; command replies come back as
//! `SUCCESS:`/`ERROR:` lines in command order, so replies are matched to
//! callers with a queue of oneshot slots.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::unix::OwnedWriteHalf;
use tokio::net::UnixStream;
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, trace};

use crate::VpnError;

const EVENT_BUFFER: usize = 16;

/// Asynchronous notifications from the managed process.
#[derive(Debug, Clone)]
pub enum MgmtEvent {
    /// The process is holding and waits for a `hold release`.
    Hold(String),
    /// Connection state change notification.
    State(StateEvent),
    /// Log line forwarded over the management channel.
    Log(String),
    /// Anything we have no special handling for.
    Other { kind: String, body: String },
}

/// A `>STATE:` notification. The body is comma-separated with the state
/// name in the second field.
#[derive(Debug, Clone)]
pub struct StateEvent {
    body: String,
}

impl StateEvent {
    pub fn new_state(&self) -> &str {
        self.body.split(',').nth(1).unwrap_or("")
    }

    pub fn raw(&self) -> &str {
        &self.body
    }
}

type ReplySlot = oneshot::Sender<Result<String, String>>;

/// Command side of an open management connection. Cheap to clone.
#[derive(Clone)]
pub struct MgmtClient {
    writer: Arc<Mutex<OwnedWriteHalf>>,
    pending: Arc<Mutex<VecDeque<ReplySlot>>>,
}

impl MgmtClient {
    /// Take over an accepted management connection. Spawns the reader task;
    /// the returned receiver yields events until the process closes the
    /// socket, then ends.
    pub fn open(stream: UnixStream) -> (MgmtClient, mpsc::Receiver<MgmtEvent>) {
        let (read_half, write_half) = stream.into_split();
        let (event_tx, event_rx) = mpsc::channel(EVENT_BUFFER);

        let pending: Arc<Mutex<VecDeque<ReplySlot>>> = Arc::new(Mutex::new(VecDeque::new()));
        let client = MgmtClient {
            writer: Arc::new(Mutex::new(write_half)),
            pending: pending.clone(),
        };

        tokio::spawn(async move {
            let mut lines = BufReader::new(read_half).lines();
            while let Ok(Some(line)) = lines.next_line().await {
                trace!("mgmt <- {line}");
                if let Some(rest) = line.strip_prefix('>') {
                    let (kind, body) = rest.split_once(':').unwrap_or((rest, ""));
                    let event = parse_event(kind, body);
                    if event_tx.send(event).await.is_err() {
                        break;
                    }
                } else if let Some(msg) = line.strip_prefix("SUCCESS:") {
                    reply(&pending, Ok(msg.trim().to_string())).await;
                } else if let Some(msg) = line.strip_prefix("ERROR:") {
                    reply(&pending, Err(msg.trim().to_string())).await;
                }
                // Anything else is banner or continuation output; skip it.
            }
            debug!("management connection closed");
            // Callers still waiting for a reply will never get one.
            pending.lock().await.clear();
        });

        (client, event_rx)
    }

    /// Enable real-time `>STATE:` notifications.
    pub async fn enable_state_events(&self) -> Result<(), VpnError> {
        self.command("state on").await.map(|_| ())
    }

    /// Release a startup hold so the process begins connecting.
    pub async fn hold_release(&self) -> Result<(), VpnError> {
        self.command("hold release").await.map(|_| ())
    }

    /// Deliver a named signal (e.g. `SIGTERM`) through the management
    /// channel.
    pub async fn send_signal(&self, name: &str) -> Result<(), VpnError> {
        self.command(&format!("signal {name}")).await.map(|_| ())
    }

    async fn command(&self, cmd: &str) -> Result<String, VpnError> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.push_back(tx);

        {
            let mut writer = self.writer.lock().await;
            let write = async {
                writer.write_all(cmd.as_bytes()).await?;
                writer.write_all(b"\n").await
            };
            if let Err(e) = write.await {
                // The reply slot we queued will never be filled.
                self.pending.lock().await.pop_back();
                return Err(VpnError::MgmtIo(e));
            }
        }

        match rx.await {
            Ok(Ok(msg)) => Ok(msg),
            Ok(Err(message)) => Err(VpnError::MgmtCommand {
                command: cmd.to_string(),
                message,
            }),
            Err(_) => Err(VpnError::MgmtClosed),
        }
    }
}

async fn reply(pending: &Mutex<VecDeque<ReplySlot>>, result: Result<String, String>) {
    match pending.lock().await.pop_front() {
        Some(slot) => {
            let _ = slot.send(result);
        }
        None => debug!("management reply with no pending command: {result:?}"),
    }
}

fn parse_event(kind: &str, body: &str) -> MgmtEvent {
    match kind {
        "HOLD" => MgmtEvent::Hold(body.to_string()),
        "STATE" => MgmtEvent::State(StateEvent {
            body: body.to_string(),
        }),
        "LOG" => MgmtEvent::Log(body.to_string()),
        _ => MgmtEvent::Other {
            kind: kind.to_string(),
            body: body.to_string(),
        },
    }
}
