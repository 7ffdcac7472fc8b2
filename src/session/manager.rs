//! Session lifecycle manager.
//!
//! Owns the create-or-reuse protocol around per-user clients: single-flight
//! initialization, the event-driven connection state machine, the
//! reconnection policy, idle eviction and logout. All per-user mutation is
//! serialized through the entry's state mutex; client construction,
//! eviction and logout additionally hold the entry's init lock so handle
//! ownership never races.

use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use base64::Engine;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use super::errors::SessionError;
use super::reconnect::{classify, DisconnectClass};
use super::registry::{SessionEntry, SessionRegistry};
use super::state::{SessionSnapshot, SessionStatus};
use crate::protocol::{
    normalize_identity, normalize_recipient, ClientFactory, ProtocolClient, ProtocolEvent,
};
use crate::supervisor::recovery::{locked_profile_path, ProfileRecovery};

/// Lifecycle tunables, all env-supplied.
#[derive(Debug, Clone)]
pub struct SessionManagerConfig {
    /// Root under which each user gets one credential directory.
    pub storage_root: PathBuf,
    /// Delay before re-initializing after a retryable disconnect.
    pub retry_delay: Duration,
    /// Disconnect codes that warrant the delayed retry.
    pub retryable_codes: Vec<String>,
}

pub struct SessionManager {
    registry: Arc<SessionRegistry>,
    factory: Arc<dyn ClientFactory>,
    recovery: Arc<dyn ProfileRecovery>,
    config: SessionManagerConfig,
    /// Cleared on shutdown; gates event pumps, scheduled retries and the
    /// eviction sweep.
    running: Arc<AtomicBool>,
    me: Weak<SessionManager>,
}

impl SessionManager {
    pub fn new(
        registry: Arc<SessionRegistry>,
        factory: Arc<dyn ClientFactory>,
        recovery: Arc<dyn ProfileRecovery>,
        config: SessionManagerConfig,
    ) -> Arc<Self> {
        Arc::new_cyclic(|me| Self {
            registry,
            factory,
            recovery,
            config,
            running: Arc::new(AtomicBool::new(true)),
            me: me.clone(),
        })
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn running(&self) -> Arc<AtomicBool> {
        self.running.clone()
    }

    /// Credential directory for a user, named deterministically from the id.
    pub fn storage_dir(&self, user_id: &str) -> PathBuf {
        self.config.storage_root.join(sanitize_dir_name(user_id))
    }

    /// Kick off initialization for a user and report the resulting status.
    ///
    /// Marks the session `starting` synchronously when a launch is possible,
    /// then runs the single-flight initializer in the background; callers
    /// poll status/qr afterwards. A session already starting, pairing or
    /// ready is left alone.
    pub async fn start(&self, user_id: &str) -> SessionSnapshot {
        let entry = self.registry.get_or_create(user_id);
        entry.touch();

        let launch = {
            let mut state = entry.state.lock().await;
            match state.status {
                SessionStatus::Starting | SessionStatus::AwaitingScan | SessionStatus::Ready => {
                    false
                }
                SessionStatus::Idle | SessionStatus::Error | SessionStatus::Disconnected => {
                    state.status = SessionStatus::Starting;
                    state.qr_payload = None;
                    state.identity = None;
                    state.last_error = None;
                    true
                }
            }
        };

        if launch {
            if let Some(manager) = self.me.upgrade() {
                let uid = user_id.to_string();
                tokio::spawn(async move {
                    if let Err(e) = manager.ensure_client(&uid).await {
                        warn!("[Session:{}] initialization failed: {}", uid, e);
                    }
                });
            }
        }

        self.registry.snapshot(user_id).await
    }

    /// Single-flight create-or-reuse of the user's protocol client.
    ///
    /// At most one construction per user runs at a time; racing callers
    /// suspend on the init lock and observe whatever state the initializer
    /// left behind. Different users initialize fully in parallel.
    pub async fn ensure_client(
        &self,
        user_id: &str,
    ) -> Result<Arc<dyn ProtocolClient>, SessionError> {
        let entry = self.registry.get_or_create(user_id);

        // Fast path: a live handle needs no lock ceremony.
        let observed_epoch = {
            let state = entry.state.lock().await;
            if let Some(client) = state.client.clone() {
                return Ok(client);
            }
            state.init_epoch
        };

        let _init = entry.init_lock.lock().await;

        // Re-check: an initializer we waited on may have finished the job.
        {
            let state = entry.state.lock().await;
            if let Some(client) = state.client.clone() {
                return Ok(client);
            }
            // An attempt we queued behind completed without leaving a
            // handle; report its outcome instead of constructing again.
            if state.init_epoch != observed_epoch {
                let reason = state
                    .last_error
                    .clone()
                    .unwrap_or_else(|| "initialization failed".to_string());
                return Err(SessionError::InitFailed(reason));
            }
        }

        {
            let mut state = entry.state.lock().await;
            state.status = SessionStatus::Starting;
            state.qr_payload = None;
            state.identity = None;
            state.last_error = None;
        }

        let dir = self.storage_dir(user_id);
        if let Err(e) = tokio::fs::create_dir_all(&dir).await {
            return Err(self.fail_init(&entry, SessionError::Io(e)).await);
        }

        info!("[Session:{}] constructing protocol client", user_id);
        let mut attempt = self.factory.connect(user_id, &dir).await;

        // Locked-profile recovery: clean up the stray holder and retry
        // construction exactly once.
        if let Err(err) = &attempt {
            let diagnostic = err.to_string();
            if let Some(path) = locked_profile_path(&diagnostic) {
                warn!(
                    "[Session:{}] storage locked, running recovery on {}",
                    user_id,
                    path.display()
                );
                self.recovery.recover_locked_storage(&path).await;
                attempt = self.factory.connect(user_id, &dir).await;
            }
        }

        match attempt {
            Ok((client, events)) => {
                let generation = {
                    let mut state = entry.state.lock().await;
                    state.init_epoch += 1;
                    state.install_client(client.clone())
                };
                entry.touch();
                self.spawn_event_pump(entry.clone(), events, generation);
                Ok(client)
            }
            Err(e) => Err(self.fail_init(&entry, SessionError::Protocol(e)).await),
        }
    }

    async fn fail_init(&self, entry: &Arc<SessionEntry>, err: SessionError) -> SessionError {
        error!("[Session:{}] client construction failed: {}", entry.user_id, err);
        let mut state = entry.state.lock().await;
        state.init_epoch += 1;
        state.status = SessionStatus::Error;
        state.qr_payload = None;
        state.last_error = Some(err.to_string());
        err
    }

    /// Send a text message through the user's connected session.
    pub async fn send(&self, user_id: &str, to: &str, message: &str) -> Result<(), SessionError> {
        let entry = self.registry.get_or_create(user_id);
        entry.touch();

        let client = {
            let state = entry.state.lock().await;
            match (state.status, state.client.clone()) {
                (SessionStatus::Ready, Some(client)) => client,
                (status, _) => return Err(SessionError::NotConnected { status }),
            }
        };

        let recipient = normalize_recipient(to);
        debug!("[Session:{}] sending message to {}", user_id, recipient);
        client.send_text(&recipient, message).await?;
        entry.touch();
        Ok(())
    }

    /// Tear the session down and wipe its credentials. Idempotent: a second
    /// logout on an idle session is a no-op.
    pub async fn logout(&self, user_id: &str) -> Result<(), SessionError> {
        let entry = self.registry.get_or_create(user_id);
        let _init = entry.init_lock.lock().await;

        let client = {
            let mut state = entry.state.lock().await;
            let client = state.take_client();
            state.reset_to_idle();
            client
        };

        if let Some(client) = client {
            if let Err(e) = client.logout().await {
                warn!("[Session:{}] remote logout failed: {}", user_id, e);
            }
            if let Err(e) = client.destroy().await {
                warn!("[Session:{}] client teardown failed: {}", user_id, e);
            }
        }

        self.delete_storage(user_id).await?;
        entry.touch();
        info!("[Session:{}] logged out", user_id);
        Ok(())
    }

    /// Release every `ready` session idle for longer than `ttl`.
    ///
    /// Credentials stay on disk, so the next start reconnects without a new
    /// QR pairing. Returns how many sessions were released.
    pub async fn evict_idle(&self, ttl: Duration) -> usize {
        let mut evicted = 0;
        for entry in self.registry.entries() {
            if entry.idle_for() < ttl {
                continue;
            }
            // Serialize with any in-flight initialization for this user.
            let _init = entry.init_lock.lock().await;
            let client = {
                let mut state = entry.state.lock().await;
                if state.status != SessionStatus::Ready || entry.idle_for() < ttl {
                    continue;
                }
                let client = state.take_client();
                state.reset_to_idle();
                client
            };
            if let Some(client) = client {
                if let Err(e) = client.destroy().await {
                    warn!("[Session:{}] eviction teardown failed: {}", entry.user_id, e);
                }
            }
            info!("[Session:{}] evicted after idle TTL", entry.user_id);
            evicted += 1;
        }
        evicted
    }

    /// Stop background work and release every live client.
    pub async fn shutdown(&self) {
        self.running.store(false, Ordering::Relaxed);
        let mut teardown = Vec::new();
        for entry in self.registry.entries() {
            let mut state = entry.state.lock().await;
            if let Some(client) = state.take_client() {
                state.reset_to_idle();
                teardown.push(async move {
                    let _ = client.destroy().await;
                });
            }
        }
        futures::future::join_all(teardown).await;
        info!("[Session] all clients released");
    }

    fn spawn_event_pump(
        &self,
        entry: Arc<SessionEntry>,
        mut events: mpsc::Receiver<ProtocolEvent>,
        generation: u64,
    ) {
        let Some(manager) = self.me.upgrade() else {
            return;
        };
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if !manager.running.load(Ordering::Relaxed) {
                    break;
                }
                manager.apply_event(&entry, generation, event).await;
            }
            debug!("[Session:{}] event stream ended", entry.user_id);
        });
    }

    /// Apply one protocol event to the state machine. Events carrying a
    /// stale generation belong to a superseded client and are dropped.
    async fn apply_event(&self, entry: &Arc<SessionEntry>, generation: u64, event: ProtocolEvent) {
        match event {
            ProtocolEvent::Qr(challenge) => {
                let mut state = entry.state.lock().await;
                if state.generation != generation {
                    return;
                }
                if !matches!(
                    state.status,
                    SessionStatus::Starting | SessionStatus::AwaitingScan
                ) {
                    return;
                }
                match encode_qr_payload(&challenge) {
                    Ok(payload) => {
                        state.status = SessionStatus::AwaitingScan;
                        state.qr_payload = Some(payload);
                        entry.touch();
                        info!("[Session:{}] QR challenge pending", entry.user_id);
                    }
                    Err(e) => {
                        error!("[Session:{}] QR encoding failed: {}", entry.user_id, e);
                        let client = state.take_client();
                        state.status = SessionStatus::Error;
                        state.qr_payload = None;
                        state.last_error = Some(e.to_string());
                        drop(state);
                        if let Some(client) = client {
                            tokio::spawn(async move {
                                let _ = client.destroy().await;
                            });
                        }
                    }
                }
            }
            ProtocolEvent::Ready { self_id } => {
                let mut state = entry.state.lock().await;
                if state.generation != generation {
                    return;
                }
                let identity = normalize_identity(&self_id);
                info!("[Session:{}] connected as {}", entry.user_id, identity);
                state.status = SessionStatus::Ready;
                state.qr_payload = None;
                state.identity = Some(identity);
                state.last_error = None;
                entry.touch();
            }
            ProtocolEvent::Disconnected { reason } => {
                self.handle_disconnect(entry, generation, reason).await;
            }
        }
    }

    async fn handle_disconnect(&self, entry: &Arc<SessionEntry>, generation: u64, reason: String) {
        let client = {
            let mut state = entry.state.lock().await;
            if state.generation != generation {
                return;
            }
            state.status = SessionStatus::Disconnected;
            state.qr_payload = None;
            state.identity = None;
            state.last_error = Some(format!("disconnected: {reason}"));
            state.take_client()
        };
        entry.touch();
        if let Some(client) = client {
            let _ = client.destroy().await;
        }

        match classify(&reason, &self.config.retryable_codes) {
            DisconnectClass::TerminalLogout => {
                info!(
                    "[Session:{}] remote logout, clearing credentials",
                    entry.user_id
                );
                if let Err(e) = self.delete_storage(&entry.user_id).await {
                    warn!(
                        "[Session:{}] failed to clear credential storage: {}",
                        entry.user_id, e
                    );
                }
                let mut state = entry.state.lock().await;
                // A concurrent start may already have begun a fresh attempt;
                // only quiesce if nothing else moved the session on.
                if state.status == SessionStatus::Disconnected && state.client.is_none() {
                    state.reset_to_idle();
                }
            }
            DisconnectClass::Retryable => {
                info!(
                    "[Session:{}] retryable disconnect ({}), reconnecting in {:?}",
                    entry.user_id, reason, self.config.retry_delay
                );
                let Some(manager) = self.me.upgrade() else {
                    return;
                };
                let uid = entry.user_id.clone();
                tokio::spawn(async move {
                    tokio::time::sleep(manager.config.retry_delay).await;
                    if !manager.running.load(Ordering::Relaxed) {
                        return;
                    }
                    if let Err(e) = manager.ensure_client(&uid).await {
                        warn!("[Session:{}] scheduled reconnect failed: {}", uid, e);
                    }
                });
            }
            DisconnectClass::Unknown => {
                warn!(
                    "[Session:{}] unclassified disconnect code: {}",
                    entry.user_id, reason
                );
            }
        }
    }

    /// Remove the user's credential directory. Safe when already absent.
    async fn delete_storage(&self, user_id: &str) -> std::io::Result<()> {
        match tokio::fs::remove_dir_all(self.storage_dir(user_id)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e),
        }
    }
}

/// Encode a pairing challenge into the payload surfaced over HTTP. Image
/// rendering is the caller's concern.
fn encode_qr_payload(challenge: &str) -> Result<String, SessionError> {
    if challenge.trim().is_empty() {
        return Err(SessionError::QrEncode(
            "empty challenge from protocol".to_string(),
        ));
    }
    Ok(base64::engine::general_purpose::STANDARD.encode(challenge))
}

/// Map a user id onto a filesystem-safe directory name.
fn sanitize_dir_name(user_id: &str) -> String {
    let name: String = user_id
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect();
    // "." and ".." are path components, not directory names; an id made of
    // dots would resolve at or above the storage root.
    if name.is_empty() || name.bytes().all(|b| b == b'.') {
        return "_".repeat(name.len().max(1));
    }
    name
}
