//! Session lifecycle core
//!
//! One logical session per user: registry, single-flight initialization,
//! connection state machine, reconnection policy and idle eviction.

mod errors;
mod manager;
mod reconnect;
mod registry;
mod state;

pub use errors::SessionError;
pub use manager::{SessionManager, SessionManagerConfig};
pub use reconnect::{classify, default_retryable_codes, DisconnectClass, TERMINAL_LOGOUT_CODE};
pub use registry::{SessionEntry, SessionRegistry};
pub use state::{SessionSnapshot, SessionState, SessionStatus};
