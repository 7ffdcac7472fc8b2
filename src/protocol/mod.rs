//! Protocol client boundary.
//!
//! The messaging-protocol library itself is an external collaborator; this
//! module pins down the surface the gateway relies on: constructing a client
//! bound to a per-user credential directory, sending text messages, and
//! receiving lifecycle events (QR challenge, connection open, disconnect).

mod bridge;

pub use bridge::{BridgeClientFactory, BridgeConfig};

use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use thiserror::Error;
use tokio::sync::mpsc;

/// Fixed routing domain outbound recipients are addressed under.
pub const ROUTING_DOMAIN: &str = "c.us";

/// Lifecycle events delivered asynchronously by a live client.
#[derive(Debug, Clone)]
pub enum ProtocolEvent {
    /// A pairing challenge to display to the end user. Rotates periodically
    /// until scanned.
    Qr(String),
    /// The connection is open and authenticated. `self_id` is the protocol's
    /// own identifier for the account, typically `<number>:<device>@<domain>`.
    Ready { self_id: String },
    /// The connection closed with the given protocol reason code.
    Disconnected { reason: String },
}

/// Protocol-level errors
#[derive(Error, Debug)]
pub enum ProtocolError {
    #[error("Failed to start client: {0}")]
    ConnectFailed(String),

    #[error("Send failed: {0}")]
    SendFailed(String),

    #[error("Client storage locked: {0}")]
    StorageLocked(String),

    #[error("Client exited: {0}")]
    ClientGone(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// A live (or in-progress) connection to the messaging network for one user.
#[async_trait]
pub trait ProtocolClient: Send + Sync {
    /// Send a text message to an already-normalized recipient address.
    async fn send_text(&self, to: &str, body: &str) -> Result<(), ProtocolError>;

    /// Invalidate the remote session. Credential storage on disk is the
    /// caller's to delete.
    async fn logout(&self) -> Result<(), ProtocolError>;

    /// Tear the connection down without touching credentials.
    async fn destroy(&self) -> Result<(), ProtocolError>;
}

/// Constructor seam for protocol clients.
///
/// The returned receiver carries the client's lifecycle events until the
/// client is destroyed or the backend goes away.
#[async_trait]
pub trait ClientFactory: Send + Sync {
    async fn connect(
        &self,
        user_id: &str,
        storage_dir: &Path,
    ) -> Result<(Arc<dyn ProtocolClient>, mpsc::Receiver<ProtocolEvent>), ProtocolError>;
}

/// Extract the bare account identifier from the protocol's self-identifier.
///
/// `"14155550100:3@c.us"` becomes `"14155550100"`.
pub fn normalize_identity(self_id: &str) -> String {
    self_id
        .split([':', '@'])
        .next()
        .unwrap_or(self_id)
        .to_string()
}

/// Normalize a user-supplied recipient address: digits only, suffixed with
/// the routing domain unless already fully addressed.
pub fn normalize_recipient(to: &str) -> String {
    let suffix = format!("@{ROUTING_DOMAIN}");
    if to.ends_with(&suffix) {
        return to.to_string();
    }
    let digits: String = to.chars().filter(|c| c.is_ascii_digit()).collect();
    format!("{digits}{suffix}")
}

#[cfg(test)]
pub(crate) mod mock;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_strips_device_and_domain() {
        assert_eq!(normalize_identity("14155550100:3@c.us"), "14155550100");
        assert_eq!(normalize_identity("14155550100@c.us"), "14155550100");
        assert_eq!(normalize_identity("14155550100"), "14155550100");
    }

    #[test]
    fn recipient_strips_non_digits_and_suffixes_domain() {
        assert_eq!(normalize_recipient("555-1234"), "5551234@c.us");
        assert_eq!(normalize_recipient("+1 (415) 555-0100"), "14155550100@c.us");
    }

    #[test]
    fn recipient_already_addressed_is_untouched() {
        assert_eq!(normalize_recipient("5551234@c.us"), "5551234@c.us");
    }
}
