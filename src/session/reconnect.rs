//! Disconnect-code classification for the reconnection policy.
//!
//! The set of codes worth retrying differs between protocol-library
//! versions, so it is configuration (`WAGATE_RETRY_CODES`) rather than
//! hardcoded; the default set covers the transient conditions the stock
//! library reports.

/// The remote side invalidated our credentials; storage must be wiped and a
/// fresh QR pairing is required.
pub const TERMINAL_LOGOUT_CODE: &str = "LOGOUT";

/// Disconnect codes that warrant an automatic delayed reconnect.
pub fn default_retryable_codes() -> Vec<String> {
    [
        "RESTART_REQUIRED",
        "TIMEOUT",
        "CONNECTION_LOST",
        "CONNECTION_CLOSED",
        "BAD_SESSION",
        "DEPRECATED_VERSION",
    ]
    .iter()
    .map(|s| s.to_string())
    .collect()
}

/// What to do about a disconnect.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DisconnectClass {
    /// Credentials permanently invalid: wipe storage, reset to idle, no retry.
    TerminalLogout,
    /// Transient: schedule a delayed re-initialization.
    Retryable,
    /// Unclassified: stay disconnected with the raw code recorded; an
    /// explicit start is required to recover.
    Unknown,
}

pub fn classify(reason: &str, retryable: &[String]) -> DisconnectClass {
    let reason = reason.trim();
    if reason.eq_ignore_ascii_case(TERMINAL_LOGOUT_CODE) {
        return DisconnectClass::TerminalLogout;
    }
    if retryable.iter().any(|c| c.eq_ignore_ascii_case(reason)) {
        return DisconnectClass::Retryable;
    }
    DisconnectClass::Unknown
}
