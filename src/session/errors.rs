//! Session error types

use thiserror::Error;

use super::state::SessionStatus;
use crate::protocol::ProtocolError;

/// Session-level errors surfaced to callers
#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Session not connected (status: {status})")]
    NotConnected { status: SessionStatus },

    #[error("Protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Invalid QR challenge: {0}")]
    QrEncode(String),

    #[error("Initialization failed: {0}")]
    InitFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}
