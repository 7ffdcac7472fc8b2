//! wagate
//!
//! Multi-tenant messaging gateway: one protocol-client session per logical
//! user, with QR pairing, automatic reconnection, idle eviction and an HTTP
//! surface for status queries and outbound messages.

pub mod protocol;
pub mod session;
pub mod supervisor;
pub mod web;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tracing::info;

use protocol::ClientFactory;
use session::{default_retryable_codes, SessionManager, SessionManagerConfig, SessionRegistry};
use supervisor::ProfileRecovery;

/// Application configuration, environment-supplied and validated at startup.
#[derive(Debug, Clone)]
pub struct AppConfig {
    /// Listening port (`WAGATE_PORT`).
    pub port: u16,
    /// Shared-secret header key (`WAGATE_API_KEY`). Empty rejects everything.
    pub api_key: String,
    /// Root of per-user credential storage (`WAGATE_STORAGE_DIR`).
    pub storage_root: PathBuf,
    /// Idle TTL before a ready session is evicted (`WAGATE_IDLE_TTL_SECS`).
    pub idle_ttl: Duration,
    /// Eviction sweep interval (`WAGATE_SWEEP_INTERVAL_SECS`).
    pub sweep_interval: Duration,
    /// Delay before reconnecting after a retryable disconnect
    /// (`WAGATE_RETRY_DELAY_MS`).
    pub retry_delay: Duration,
    /// Disconnect codes worth retrying (`WAGATE_RETRY_CODES`, comma-separated).
    pub retryable_codes: Vec<String>,
    /// Bridge executable spawned per user session (`WAGATE_BRIDGE_CMD`).
    pub bridge_command: PathBuf,
    /// Optional browser binary override for the bridge (`WAGATE_BROWSER_PATH`).
    pub browser_path: Option<PathBuf>,
}

/// Startup configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid value for {name}: {value:?}")]
    Invalid { name: &'static str, value: String },

    #[error("no storage root: set WAGATE_STORAGE_DIR or provide a platform data directory")]
    NoStorageRoot,
}

fn env_parse<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match std::env::var(name) {
        Ok(raw) if !raw.is_empty() => raw
            .parse()
            .map_err(|_| ConfigError::Invalid { name, value: raw }),
        _ => Ok(default),
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let storage_root = match std::env::var("WAGATE_STORAGE_DIR") {
            Ok(dir) if !dir.is_empty() => PathBuf::from(dir),
            _ => dirs::data_dir()
                .map(|p| p.join("wagate").join("sessions"))
                .ok_or(ConfigError::NoStorageRoot)?,
        };

        let retryable_codes = match std::env::var("WAGATE_RETRY_CODES") {
            Ok(raw) if !raw.trim().is_empty() => raw
                .split(',')
                .map(|c| c.trim().to_string())
                .filter(|c| !c.is_empty())
                .collect(),
            _ => default_retryable_codes(),
        };

        Ok(Self {
            port: env_parse("WAGATE_PORT", 8080)?,
            api_key: std::env::var("WAGATE_API_KEY").unwrap_or_default(),
            storage_root,
            idle_ttl: Duration::from_secs(env_parse("WAGATE_IDLE_TTL_SECS", 1800u64)?),
            sweep_interval: Duration::from_secs(env_parse("WAGATE_SWEEP_INTERVAL_SECS", 60u64)?),
            retry_delay: Duration::from_millis(env_parse("WAGATE_RETRY_DELAY_MS", 1500u64)?),
            retryable_codes,
            bridge_command: PathBuf::from(
                std::env::var("WAGATE_BRIDGE_CMD").unwrap_or_else(|_| "wagate-bridge".to_string()),
            ),
            browser_path: std::env::var("WAGATE_BROWSER_PATH")
                .ok()
                .filter(|p| !p.is_empty())
                .map(PathBuf::from),
        })
    }

    /// Small config for in-process tests: tight timers, isolated storage.
    #[cfg(test)]
    pub fn for_tests(storage_root: &std::path::Path) -> Self {
        Self {
            port: 0,
            api_key: "test-key".to_string(),
            storage_root: storage_root.to_path_buf(),
            idle_ttl: Duration::from_millis(50),
            sweep_interval: Duration::from_millis(20),
            retry_delay: Duration::from_millis(20),
            retryable_codes: default_retryable_codes(),
            bridge_command: PathBuf::from("wagate-bridge"),
            browser_path: None,
        }
    }
}

/// Get log directory path
pub fn log_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("wagate").join("logs"))
}

/// Application state shared across request handlers and background tasks
pub struct AppState {
    pub config: AppConfig,
    pub manager: Arc<SessionManager>,
}

impl AppState {
    /// Wire the lifecycle core together. The protocol backend and the
    /// recovery strategy are injected so tests can script them.
    pub fn new(
        config: AppConfig,
        factory: Arc<dyn ClientFactory>,
        recovery: Arc<dyn ProfileRecovery>,
    ) -> Self {
        let manager = SessionManager::new(
            Arc::new(SessionRegistry::new()),
            factory,
            recovery,
            SessionManagerConfig {
                storage_root: config.storage_root.clone(),
                retry_delay: config.retry_delay,
                retryable_codes: config.retryable_codes.clone(),
            },
        );
        Self { config, manager }
    }

    /// Release every live client and stop background work.
    pub async fn shutdown(&self) {
        self.manager.shutdown().await;
        info!("Application state torn down");
    }
}

/// Initialize logging: console layer plus a daily-rolling file layer when a
/// log directory is available.
pub fn init_logging() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::layer::SubscriberExt;
    use tracing_subscriber::util::SubscriberInitExt;

    let env_filter = tracing_subscriber::EnvFilter::from_default_env()
        .add_directive(tracing::Level::INFO.into());

    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(true)
        .with_thread_ids(false);

    if let Some(log_dir) = log_dir() {
        let _ = std::fs::create_dir_all(&log_dir);
        let file_appender = tracing_appender::rolling::daily(&log_dir, "wagate.log");
        let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

        let file_layer = tracing_subscriber::fmt::layer()
            .with_ansi(false)
            .with_target(true)
            .with_thread_ids(true)
            .with_writer(non_blocking);

        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .with(file_layer)
            .init();

        Some(guard)
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(console_layer)
            .init();

        None
    }
}
