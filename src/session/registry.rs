//! Session registry: the single source of truth mapping user ids to state.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use once_cell::sync::Lazy;
use tokio::sync::Mutex;

use super::state::{SessionSnapshot, SessionState};

static PROCESS_START: Lazy<Instant> = Lazy::new(Instant::now);

/// Milliseconds since process start; monotone, immune to wall-clock jumps.
fn monotonic_ms() -> u64 {
    PROCESS_START.elapsed().as_millis() as u64
}

/// One user's slot in the registry.
///
/// `state` serializes all mutation (state-machine transitions, send-path
/// reads); `init_lock` is the single-flight boundary held across client
/// construction, eviction and logout so handle ownership never races.
pub struct SessionEntry {
    pub user_id: String,
    pub state: Mutex<SessionState>,
    pub init_lock: Mutex<()>,
    last_activity_ms: AtomicU64,
}

impl SessionEntry {
    fn new(user_id: String) -> Self {
        Self {
            user_id,
            state: Mutex::new(SessionState::new()),
            init_lock: Mutex::new(()),
            last_activity_ms: AtomicU64::new(monotonic_ms()),
        }
    }

    /// Record activity now. fetch_max keeps the timestamp non-decreasing
    /// even when touches race.
    pub fn touch(&self) {
        self.last_activity_ms.fetch_max(monotonic_ms(), Ordering::Relaxed);
    }

    /// How long since the last recorded activity.
    pub fn idle_for(&self) -> Duration {
        let last = self.last_activity_ms.load(Ordering::Relaxed);
        Duration::from_millis(monotonic_ms().saturating_sub(last))
    }
}

/// Keyed map of all sessions. Entries are created on first access and live
/// for the life of the process; teardown only resets them to idle.
pub struct SessionRegistry {
    entries: DashMap<String, Arc<SessionEntry>>,
}

impl SessionRegistry {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
        }
    }

    /// Fetch the entry for a user, creating an idle one if absent.
    /// Idempotent: concurrent callers always land on the same entry.
    pub fn get_or_create(&self, user_id: &str) -> Arc<SessionEntry> {
        self.entries
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(SessionEntry::new(user_id.to_string())))
            .clone()
    }

    /// Read-only view for status queries (creates the entry if absent, same
    /// as get_or_create).
    pub async fn snapshot(&self, user_id: &str) -> SessionSnapshot {
        let entry = self.get_or_create(user_id);
        let state = entry.state.lock().await;
        SessionSnapshot::of(&state)
    }

    pub fn touch(&self, user_id: &str) {
        self.get_or_create(user_id).touch();
    }

    /// All current entries, for the eviction sweep and shutdown. No ordering
    /// guarantee.
    pub fn entries(&self) -> Vec<Arc<SessionEntry>> {
        self.entries.iter().map(|e| e.value().clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for SessionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::state::SessionStatus;

    #[tokio::test]
    async fn unseen_user_gets_idle_state() {
        let registry = SessionRegistry::new();
        let snap = registry.snapshot("u1").await;
        assert_eq!(snap.status, SessionStatus::Idle);
        assert!(snap.qr.is_none());
        assert!(snap.identity.is_none());
        assert!(snap.error.is_none());
    }

    #[tokio::test]
    async fn get_or_create_never_duplicates() {
        let registry = SessionRegistry::new();
        let a = registry.get_or_create("u1");
        let b = registry.get_or_create("u1");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(registry.len(), 1);
    }

    #[tokio::test]
    async fn touch_resets_idle_duration() {
        let registry = SessionRegistry::new();
        let entry = registry.get_or_create("u1");
        tokio::time::sleep(Duration::from_millis(15)).await;
        assert!(entry.idle_for() >= Duration::from_millis(10));
        entry.touch();
        assert!(entry.idle_for() < Duration::from_millis(10));
    }
}
