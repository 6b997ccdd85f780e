//! Tool availability checking
//!
//! Resolves the configured adb binary (either an explicit path or a name on
//! `PATH`) and confirms it runs before the service starts.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use tokio::process::Command;
use tokio::time::timeout;

const VERSION_TIMEOUT: Duration = Duration::from_secs(10);

/// Result of probing for the device tool at startup
#[derive(Debug, Clone, Default)]
pub struct ToolAvailability {
    /// Whether `adb version` ran successfully
    pub adb: bool,

    /// Resolved path of the adb binary
    pub adb_path: Option<PathBuf>,

    /// First line of `adb version`
    pub adb_version: Option<String>,
}

impl ToolAvailability {
    /// Check tool availability (run once at startup)
    pub async fn check(adb: &str) -> Self {
        let Some(path) = Self::resolve(adb) else {
            tracing::debug!("adb not found: {}", adb);
            return Self::default();
        };

        let version = Self::check_version(&path).await;
        Self {
            adb: version.is_some(),
            adb_path: Some(path),
            adb_version: version,
        }
    }

    /// Explicit paths are taken as-is, bare names are looked up on `PATH`
    fn resolve(adb: &str) -> Option<PathBuf> {
        let candidate = PathBuf::from(adb);
        if candidate.components().count() > 1 {
            return candidate.is_file().then_some(candidate);
        }
        which::which(adb)
            .inspect_err(|e| tracing::debug!("which {} failed: {}", adb, e))
            .ok()
    }

    async fn check_version(path: &Path) -> Option<String> {
        let output = timeout(
            VERSION_TIMEOUT,
            Command::new(path)
                .arg("version")
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::null())
                .kill_on_drop(true)
                .output(),
        )
        .await
        .ok()?
        .inspect_err(|e| tracing::debug!("adb version check failed: {}", e))
        .ok()?;

        if !output.status.success() {
            return None;
        }

        String::from_utf8_lossy(&output.stdout)
            .lines()
            .next()
            .map(|line| line.trim().to_string())
    }

    /// Get a user-friendly message about what's unavailable
    pub fn unavailability_message(&self) -> Option<String> {
        if self.adb {
            None
        } else {
            Some(
                "adb not found or not runnable. Install Android platform-tools or set [adb] path in .fleet/config.toml"
                    .to_string(),
            )
        }
    }
}
