//! Background supervision
//!
//! Periodic idle-session eviction and best-effort recovery of locked
//! browser profiles left behind by stray bridge processes.

pub mod recovery;
mod sweeper;

pub use recovery::{ProcessRecovery, ProfileRecovery};
pub use sweeper::{IdleEvictionSweeper, SweeperConfig};
