//! wagate - standalone gateway server
//!
//! Environment variables:
//! - `WAGATE_PORT` - listening port (default: 8080)
//! - `WAGATE_API_KEY` - shared-secret header key (empty rejects all requests)
//! - `WAGATE_STORAGE_DIR` - root of per-user credential storage
//! - `WAGATE_IDLE_TTL_SECS` - idle TTL before eviction (default: 1800)
//! - `WAGATE_SWEEP_INTERVAL_SECS` - eviction sweep interval (default: 60)
//! - `WAGATE_RETRY_DELAY_MS` - reconnect delay (default: 1500)
//! - `WAGATE_RETRY_CODES` - comma-separated retryable disconnect codes
//! - `WAGATE_BRIDGE_CMD` - protocol bridge executable (default: wagate-bridge)
//! - `WAGATE_BROWSER_PATH` - optional browser binary override for the bridge

use std::sync::Arc;

use tracing::{info, warn};

use wagate::protocol::{BridgeClientFactory, BridgeConfig};
use wagate::supervisor::{IdleEvictionSweeper, ProcessRecovery, SweeperConfig};
use wagate::{AppConfig, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _guard = wagate::init_logging();

    let config = AppConfig::from_env()?;
    info!("Starting wagate (port {})", config.port);
    if let Some(dir) = wagate::log_dir() {
        info!("Log files saved to: {}", dir.display());
    }
    if config.api_key.is_empty() {
        warn!("WAGATE_API_KEY is not set: every request will be rejected");
    }
    info!("Credential storage root: {}", config.storage_root.display());

    let factory = Arc::new(BridgeClientFactory::new(BridgeConfig {
        command: config.bridge_command.clone(),
        browser_path: config.browser_path.clone(),
    }));
    let state = Arc::new(AppState::new(config, factory, Arc::new(ProcessRecovery)));

    let sweeper = IdleEvictionSweeper::start(
        state.manager.running(),
        state.manager.clone(),
        SweeperConfig {
            interval: state.config.sweep_interval,
            idle_ttl: state.config.idle_ttl,
        },
    );

    // Blocks until ctrl-c.
    wagate::web::start_server(state.clone()).await?;

    state.shutdown().await;
    sweeper.abort();
    info!("Goodbye");
    Ok(())
}
