//! Idle-session eviction sweep.
//!
//! Bounds concurrent resource usage (one protocol client per active user) by
//! periodically releasing `ready` sessions that nobody has touched within
//! the idle TTL. Credentials stay on disk; the next start reconnects
//! without a fresh QR pairing.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info};

use crate::session::SessionManager;

/// Sweeper configuration
#[derive(Debug, Clone)]
pub struct SweeperConfig {
    /// How often to scan the registry.
    pub interval: Duration,
    /// How long a ready session may sit unused before release.
    pub idle_ttl: Duration,
}

/// Background task evicting idle sessions
pub struct IdleEvictionSweeper;

impl IdleEvictionSweeper {
    /// Start the sweep loop. Runs until `running` clears.
    pub fn start(
        running: Arc<AtomicBool>,
        manager: Arc<SessionManager>,
        config: SweeperConfig,
    ) -> tokio::task::JoinHandle<()> {
        tokio::spawn(async move {
            info!(
                "[Sweeper] started (interval {:?}, idle TTL {:?})",
                config.interval, config.idle_ttl
            );

            while running.load(Ordering::Relaxed) {
                tokio::time::sleep(config.interval).await;
                if !running.load(Ordering::Relaxed) {
                    break;
                }

                let evicted = manager.evict_idle(config.idle_ttl).await;
                if evicted > 0 {
                    info!("[Sweeper] evicted {} idle sessions", evicted);
                } else {
                    debug!(
                        "[Sweeper] nothing to evict ({} sessions tracked)",
                        manager.registry().len()
                    );
                }
            }

            info!("[Sweeper] stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::mock::MockFactory;
    use crate::protocol::ProtocolEvent;
    use crate::session::{
        default_retryable_codes, SessionManagerConfig, SessionRegistry, SessionStatus,
    };
    use crate::supervisor::recovery::ProfileRecovery;
    use async_trait::async_trait;
    use std::path::Path;

    struct NoopRecovery;

    #[async_trait]
    impl ProfileRecovery for NoopRecovery {
        async fn recover_locked_storage(&self, _path: &Path) {}
    }

    #[tokio::test]
    async fn sweep_loop_evicts_and_stops_on_flag() {
        let storage = tempfile::tempdir().unwrap();
        let factory = Arc::new(MockFactory::new());
        let manager = SessionManager::new(
            Arc::new(SessionRegistry::new()),
            factory.clone(),
            Arc::new(NoopRecovery),
            SessionManagerConfig {
                storage_root: storage.path().to_path_buf(),
                retry_delay: Duration::from_millis(10),
                retryable_codes: default_retryable_codes(),
            },
        );

        manager.ensure_client("u1").await.unwrap();
        factory
            .last_sender()
            .send(ProtocolEvent::Ready {
                self_id: "1:1@c.us".to_string(),
            })
            .await
            .unwrap();
        for _ in 0..100 {
            if manager.registry().snapshot("u1").await.status == SessionStatus::Ready {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }

        let running = manager.running();
        let handle = IdleEvictionSweeper::start(
            running.clone(),
            manager.clone(),
            SweeperConfig {
                interval: Duration::from_millis(20),
                idle_ttl: Duration::from_millis(30),
            },
        );

        for _ in 0..100 {
            if manager.registry().snapshot("u1").await.status == SessionStatus::Idle {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert_eq!(
            manager.registry().snapshot("u1").await.status,
            SessionStatus::Idle
        );

        running.store(false, Ordering::Relaxed);
        tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .expect("sweeper did not stop")
            .unwrap();
    }
}
