//! Locked-profile recovery.
//!
//! A crashed or stray bridge instance can leave the per-user browser profile
//! locked (Chromium's ProcessSingleton). Recovery is best-effort: kill any
//! process still referencing the profile path, remove known lock artifacts,
//! and let the caller retry construction once.

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tracing::{debug, info, warn};

/// Lock files Chromium leaves in a profile directory.
const LOCK_ARTIFACTS: &[&str] = &[
    "SingletonLock",
    "SingletonCookie",
    "SingletonSocket",
    "lockfile",
];

/// Narrow capability seam so the manager can be tested with a stub.
#[async_trait]
pub trait ProfileRecovery: Send + Sync {
    async fn recover_locked_storage(&self, path: &Path);
}

/// Detect a locked-profile diagnostic and extract the offending path.
///
/// Returns the profile directory (the lock file's parent when the diagnostic
/// names the lock file itself), or None if this is not a lock failure or no
/// path can be found in the text.
pub fn locked_profile_path(diagnostic: &str) -> Option<PathBuf> {
    let lower = diagnostic.to_lowercase();
    let locked = lower.contains("singletonlock")
        || lower.contains("processsingleton")
        || lower.contains("already in use");
    if !locked {
        return None;
    }

    let token = diagnostic
        .split(|c: char| c.is_whitespace() || matches!(c, '"' | '\'' | '(' | ')'))
        .map(|t| t.trim_end_matches([',', '.', ';', ':']))
        .find(|t| t.len() > 1 && t.starts_with('/'))?;

    let path = Path::new(token);
    if path.file_name().map(|n| n == "SingletonLock").unwrap_or(false) {
        path.parent().map(|p| p.to_path_buf())
    } else {
        Some(path.to_path_buf())
    }
}

/// Real recovery: process kill + lock artifact removal.
pub struct ProcessRecovery;

#[async_trait]
impl ProfileRecovery for ProcessRecovery {
    async fn recover_locked_storage(&self, path: &Path) {
        let killed = kill_processes_referencing(path).await;
        if killed > 0 {
            info!(
                "[Recovery] killed {} stray processes holding {}",
                killed,
                path.display()
            );
        }
        for artifact in LOCK_ARTIFACTS {
            let lock_path = path.join(artifact);
            match tokio::fs::remove_file(&lock_path).await {
                Ok(()) => info!("[Recovery] removed {}", lock_path.display()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => debug!("[Recovery] could not remove {}: {}", lock_path.display(), e),
            }
        }
    }
}

/// Kill every process whose command line references the profile path.
/// Returns the number of killed processes.
#[cfg(not(target_os = "windows"))]
async fn kill_processes_referencing(path: &Path) -> u32 {
    use std::process::Command;

    let needle = path.to_string_lossy().to_string();
    let output = match Command::new("ps").args(["aux"]).output() {
        Ok(o) => o,
        Err(e) => {
            warn!("[Recovery] cannot enumerate processes: {}", e);
            return 0;
        }
    };

    let stdout = String::from_utf8_lossy(&output.stdout);
    let mut killed = 0u32;
    for line in stdout.lines() {
        if !line.contains(needle.as_str()) {
            continue;
        }
        // PID is the second field in ps aux output.
        if let Some(pid) = line
            .split_whitespace()
            .nth(1)
            .and_then(|s| s.parse::<u32>().ok())
        {
            if pid == std::process::id() {
                continue;
            }
            info!("[Recovery] killing PID {} holding {}", pid, path.display());
            let _ = Command::new("kill").args(["-9", &pid.to_string()]).output();
            killed += 1;
        }
    }
    killed
}

#[cfg(target_os = "windows")]
async fn kill_processes_referencing(path: &Path) -> u32 {
    // Lock artifacts are still removed; process enumeration by command line
    // is not wired up on Windows.
    warn!(
        "[Recovery] process cleanup skipped on Windows for {}",
        path.display()
    );
    0
}
