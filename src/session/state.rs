//! Per-user session state record.

use std::sync::Arc;

use crate::protocol::ProtocolClient;

/// Connection status of one user's session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    /// No connection and no attempt in progress. Initial state.
    Idle,
    /// Client construction in progress.
    Starting,
    /// Connected but unauthenticated; a QR challenge is pending.
    AwaitingScan,
    /// Connected and authenticated.
    Ready,
    /// Connection dropped; may auto-reconnect depending on the disconnect code.
    Disconnected,
    /// Unrecoverable failure; requires an explicit start to recover.
    Error,
}

impl SessionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionStatus::Idle => "idle",
            SessionStatus::Starting => "starting",
            SessionStatus::AwaitingScan => "awaiting_scan",
            SessionStatus::Ready => "ready",
            SessionStatus::Disconnected => "disconnected",
            SessionStatus::Error => "error",
        }
    }
}

impl std::fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Mutable state of one session. Always accessed through the entry's state
/// mutex so transitions stay single-writer per user.
pub struct SessionState {
    pub status: SessionStatus,
    /// Encoded pairing payload; present only in `awaiting_scan`.
    pub qr_payload: Option<String>,
    /// Normalized account identifier; present only in `ready`.
    pub identity: Option<String>,
    /// Latest diagnostic; cleared on successful transitions.
    pub last_error: Option<String>,
    /// Live protocol client; present while a connection attempt is active or
    /// established. Destroyed by whoever takes it out.
    pub client: Option<Arc<dyn ProtocolClient>>,
    /// Bumped whenever a client is installed or released, so event pumps for
    /// superseded clients can drop their callbacks.
    pub generation: u64,
    /// Bumped when a construction attempt completes, success or failure.
    /// Callers queued behind that attempt compare it to tell "the flight I
    /// waited on finished" apart from "nothing has run yet".
    pub init_epoch: u64,
}

impl SessionState {
    pub fn new() -> Self {
        Self {
            status: SessionStatus::Idle,
            qr_payload: None,
            identity: None,
            last_error: None,
            client: None,
            generation: 0,
            init_epoch: 0,
        }
    }

    /// Install a freshly constructed client. Returns the generation the
    /// client's event pump must present on every callback.
    pub fn install_client(&mut self, client: Arc<dyn ProtocolClient>) -> u64 {
        self.generation += 1;
        self.client = Some(client);
        self.generation
    }

    /// Release the client handle, invalidating its event pump. The caller
    /// owns destroying the returned handle.
    pub fn take_client(&mut self) -> Option<Arc<dyn ProtocolClient>> {
        if self.client.is_some() {
            self.generation += 1;
        }
        self.client.take()
    }

    /// Reset to the initial state, clearing all transient fields. The client
    /// handle must already have been taken.
    pub fn reset_to_idle(&mut self) {
        debug_assert!(self.client.is_none());
        self.status = SessionStatus::Idle;
        self.qr_payload = None;
        self.identity = None;
        self.last_error = None;
    }
}

impl Default for SessionState {
    fn default() -> Self {
        Self::new()
    }
}

/// Read-only view of a session, what status queries surface.
#[derive(Debug, Clone, serde::Serialize)]
pub struct SessionSnapshot {
    pub status: SessionStatus,
    pub qr: Option<String>,
    pub identity: Option<String>,
    pub error: Option<String>,
}

impl SessionSnapshot {
    pub fn of(state: &SessionState) -> Self {
        Self {
            status: state.status,
            qr: state.qr_payload.clone(),
            identity: state.identity.clone(),
            error: state.last_error.clone(),
        }
    }
}
