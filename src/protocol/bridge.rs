//! External bridge protocol backend.
//!
//! Drives the messaging protocol through a bridge process spawned once per
//! user (a browser-automation wrapper around the actual protocol library).
//! The bridge speaks newline-delimited JSON: lifecycle events and send acks
//! on stdout, commands on stdin. Killing the process tears the connection
//! down; credential storage lives in the per-user directory the bridge is
//! pointed at.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines};
use tokio::process::{Child, ChildStdin, ChildStdout};
use tokio::sync::{mpsc, oneshot, Mutex};
use tracing::{debug, warn};

use super::{ClientFactory, ProtocolClient, ProtocolError, ProtocolEvent};

/// How long to wait for the bridge to acknowledge a command.
const ACK_TIMEOUT: Duration = Duration::from_secs(30);

/// Bridge backend configuration
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// Bridge executable, invoked as `<command> --user <id> --storage-dir <dir>`.
    pub command: PathBuf,
    /// Optional browser binary override, exported as `BRIDGE_BROWSER_PATH`.
    pub browser_path: Option<PathBuf>,
}

/// Messages the bridge writes to stdout, one JSON object per line.
#[derive(Debug, serde::Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum BridgeEvent {
    /// Client construction finished; lifecycle events follow.
    Started,
    /// Construction failed before the client came up.
    Fatal { message: String },
    Qr { payload: String },
    Ready { self_id: String },
    Disconnected { reason: String },
    Ack {
        id: u64,
        #[serde(default)]
        error: Option<String>,
    },
}

/// Commands the gateway writes to the bridge's stdin.
#[derive(Debug, serde::Serialize)]
#[serde(tag = "cmd", rename_all = "snake_case")]
enum BridgeCommand<'a> {
    Send { id: u64, to: &'a str, message: &'a str },
    Logout { id: u64 },
}

type PendingAcks = Arc<Mutex<HashMap<u64, oneshot::Sender<Option<String>>>>>;

/// Spawns one bridge process per connect call.
pub struct BridgeClientFactory {
    config: BridgeConfig,
}

impl BridgeClientFactory {
    pub fn new(config: BridgeConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl ClientFactory for BridgeClientFactory {
    async fn connect(
        &self,
        user_id: &str,
        storage_dir: &Path,
    ) -> Result<(Arc<dyn ProtocolClient>, mpsc::Receiver<ProtocolEvent>), ProtocolError> {
        let mut command = tokio::process::Command::new(&self.config.command);
        command
            .arg("--user")
            .arg(user_id)
            .arg("--storage-dir")
            .arg(storage_dir)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .stderr(std::process::Stdio::piped())
            .kill_on_drop(true);
        if let Some(browser) = &self.config.browser_path {
            command.env("BRIDGE_BROWSER_PATH", browser);
        }

        let mut child = command
            .spawn()
            .map_err(|e| ProtocolError::ConnectFailed(format!("spawn bridge: {e}")))?;

        let stdin = child.stdin.take().ok_or_else(|| {
            ProtocolError::ConnectFailed("bridge stdin unavailable".to_string())
        })?;
        let stdout = child.stdout.take().ok_or_else(|| {
            ProtocolError::ConnectFailed("bridge stdout unavailable".to_string())
        })?;
        if let Some(stderr) = child.stderr.take() {
            let uid = user_id.to_string();
            tokio::spawn(async move {
                let mut lines = BufReader::new(stderr).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    warn!("[Bridge:{}] {}", uid, line);
                }
            });
        }

        let mut lines = BufReader::new(stdout).lines();

        // Startup handshake: the bridge reports `started` once the client is
        // constructed, or `fatal`/exit when construction failed.
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => match parse_line(&line) {
                    Some(BridgeEvent::Started) => break,
                    Some(BridgeEvent::Fatal { message }) => {
                        let _ = child.start_kill();
                        return Err(classify_launch_failure(message));
                    }
                    Some(other) => {
                        debug!("[Bridge:{}] pre-start event ignored: {:?}", user_id, other);
                    }
                    None => {}
                },
                Ok(None) | Err(_) => {
                    let status = child.wait().await.ok();
                    return Err(ProtocolError::ConnectFailed(format!(
                        "bridge exited during startup (status: {status:?})"
                    )));
                }
            }
        }

        let (event_tx, event_rx) = mpsc::channel(32);
        let pending: PendingAcks = Arc::new(Mutex::new(HashMap::new()));
        let closing = Arc::new(AtomicBool::new(false));

        tokio::spawn(pump_stdout(
            user_id.to_string(),
            lines,
            event_tx,
            pending.clone(),
            closing.clone(),
        ));

        let client = Arc::new(BridgeClient {
            user_id: user_id.to_string(),
            stdin: Mutex::new(stdin),
            child: Mutex::new(Some(child)),
            pending,
            next_id: AtomicU64::new(1),
            closing,
        });

        Ok((client, event_rx))
    }
}

fn parse_line(line: &str) -> Option<BridgeEvent> {
    let line = line.trim();
    if line.is_empty() {
        return None;
    }
    match serde_json::from_str(line) {
        Ok(event) => Some(event),
        Err(e) => {
            debug!("[Bridge] unparseable line ({}): {}", e, line);
            None
        }
    }
}

/// Map a launch failure diagnostic to the right error variant so callers can
/// apply profile-lock recovery.
fn classify_launch_failure(message: String) -> ProtocolError {
    if message.contains("SingletonLock") || message.contains("ProcessSingleton") {
        ProtocolError::StorageLocked(message)
    } else {
        ProtocolError::ConnectFailed(message)
    }
}

/// Translate bridge stdout lines into `ProtocolEvent`s and ack resolutions.
async fn pump_stdout(
    user_id: String,
    mut lines: Lines<BufReader<ChildStdout>>,
    event_tx: mpsc::Sender<ProtocolEvent>,
    pending: PendingAcks,
    closing: Arc<AtomicBool>,
) {
    while let Ok(Some(line)) = lines.next_line().await {
        let event = match parse_line(&line) {
            Some(e) => e,
            None => continue,
        };
        let forwarded = match event {
            BridgeEvent::Ack { id, error } => {
                if let Some(tx) = pending.lock().await.remove(&id) {
                    let _ = tx.send(error);
                }
                continue;
            }
            BridgeEvent::Qr { payload } => ProtocolEvent::Qr(payload),
            BridgeEvent::Ready { self_id } => ProtocolEvent::Ready { self_id },
            BridgeEvent::Disconnected { reason } => ProtocolEvent::Disconnected { reason },
            BridgeEvent::Started | BridgeEvent::Fatal { .. } => continue,
        };
        if event_tx.send(forwarded).await.is_err() {
            break;
        }
    }

    // Unexpected process death surfaces as a disconnect; an intentional
    // destroy() suppresses the synthetic event.
    if !closing.load(Ordering::Relaxed) {
        warn!("[Bridge:{}] process ended unexpectedly", user_id);
        let _ = event_tx
            .send(ProtocolEvent::Disconnected {
                reason: "CONNECTION_LOST".to_string(),
            })
            .await;
    }

    // Nothing will ack in-flight commands anymore.
    let mut pending = pending.lock().await;
    for (_, tx) in pending.drain() {
        let _ = tx.send(Some("bridge exited".to_string()));
    }
}

/// One live bridge process.
struct BridgeClient {
    user_id: String,
    stdin: Mutex<ChildStdin>,
    child: Mutex<Option<Child>>,
    pending: PendingAcks,
    next_id: AtomicU64,
    closing: Arc<AtomicBool>,
}

impl BridgeClient {
    async fn roundtrip(&self, command: BridgeCommand<'_>, id: u64) -> Result<(), ProtocolError> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(id, tx);

        let mut line = serde_json::to_vec(&command)
            .map_err(|e| ProtocolError::SendFailed(format!("encode command: {e}")))?;
        line.push(b'\n');
        let written = {
            let mut stdin = self.stdin.lock().await;
            match stdin.write_all(&line).await {
                Ok(()) => stdin.flush().await,
                Err(e) => Err(e),
            }
        };
        if let Err(e) = written {
            self.pending.lock().await.remove(&id);
            return Err(ProtocolError::ClientGone(format!("bridge stdin closed: {e}")));
        }

        match tokio::time::timeout(ACK_TIMEOUT, rx).await {
            Ok(Ok(None)) => Ok(()),
            Ok(Ok(Some(error))) => Err(ProtocolError::SendFailed(error)),
            Ok(Err(_)) => Err(ProtocolError::ClientGone("bridge exited".to_string())),
            Err(_) => {
                self.pending.lock().await.remove(&id);
                Err(ProtocolError::SendFailed("bridge ack timed out".to_string()))
            }
        }
    }
}

#[async_trait]
impl ProtocolClient for BridgeClient {
    async fn send_text(&self, to: &str, body: &str) -> Result<(), ProtocolError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.roundtrip(BridgeCommand::Send { id, to, message: body }, id)
            .await
    }

    async fn logout(&self) -> Result<(), ProtocolError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.roundtrip(BridgeCommand::Logout { id }, id).await
    }

    async fn destroy(&self) -> Result<(), ProtocolError> {
        self.closing.store(true, Ordering::Relaxed);
        if let Some(mut child) = self.child.lock().await.take() {
            debug!("[Bridge:{}] destroying client process", self.user_id);
            let _ = child.start_kill();
            let _ = child.wait().await;
        }
        Ok(())
    }
}
