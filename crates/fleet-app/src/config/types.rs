//! Configuration types for the device fleet
//!
//! Defines `Settings` (the contents of `.fleet/config.toml`) and one
//! sub-struct per section. Every field has a default so partial files work.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use fleet_adapter::CaptureOptions;

/// Application settings (.fleet/config.toml)
#[derive(Debug, Clone, Default, PartialEq, Deserialize, Serialize)]
pub struct Settings {
    #[serde(default)]
    pub adb: AdbSettings,

    #[serde(default)]
    pub mirror: MirrorSettings,

    #[serde(default)]
    pub security: SecuritySettings,

    #[serde(default)]
    pub monitor: MonitorSettings,

    #[serde(default)]
    pub hub: HubSettings,

    #[serde(default)]
    pub storage: StorageSettings,
}

/// External tool invocation
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct AdbSettings {
    /// Binary name on PATH or an absolute path
    #[serde(default = "default_adb_path")]
    pub path: String,

    /// Bound for gateway commands and file transfers
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,

    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

impl Default for AdbSettings {
    fn default() -> Self {
        Self {
            path: default_adb_path(),
            command_timeout_ms: default_command_timeout_ms(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

impl AdbSettings {
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

fn default_adb_path() -> String {
    "adb".to_string()
}

fn default_command_timeout_ms() -> u64 {
    30_000
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

/// Screen mirroring
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct MirrorSettings {
    /// Longest edge of the captured stream; 0 keeps the native size
    #[serde(default = "default_max_size")]
    pub max_size: u32,

    #[serde(default = "default_bit_rate")]
    pub bit_rate: u32,

    /// A session still `Starting` after this long is considered streaming
    #[serde(default = "default_startup_timeout_ms")]
    pub startup_timeout_ms: u64,

    /// How long a stopping capture gets to exit before it is killed
    #[serde(default = "default_stop_grace_ms")]
    pub stop_grace_ms: u64,
}

impl Default for MirrorSettings {
    fn default() -> Self {
        Self {
            max_size: default_max_size(),
            bit_rate: default_bit_rate(),
            startup_timeout_ms: default_startup_timeout_ms(),
            stop_grace_ms: default_stop_grace_ms(),
        }
    }
}

impl MirrorSettings {
    pub fn capture_options(&self) -> CaptureOptions {
        CaptureOptions {
            max_size: self.max_size,
            bit_rate: self.bit_rate,
        }
    }

    pub fn startup_timeout(&self) -> Duration {
        Duration::from_millis(self.startup_timeout_ms)
    }

    pub fn stop_grace(&self) -> Duration {
        Duration::from_millis(self.stop_grace_ms)
    }
}

fn default_max_size() -> u32 {
    720
}

fn default_bit_rate() -> u32 {
    8_000_000
}

fn default_startup_timeout_ms() -> u64 {
    5_000
}

fn default_stop_grace_ms() -> u64 {
    2_000
}

/// Command policy
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct SecuritySettings {
    /// Leading tokens a command may start with; empty allows everything
    #[serde(default = "default_allowed_commands")]
    pub allowed_commands: Vec<String>,

    /// Token-aligned prefixes that are always refused
    #[serde(default = "default_blocked_commands")]
    pub blocked_commands: Vec<String>,

    /// Command prefixes serialized against mirror start/stop on the same device
    #[serde(default = "default_mirror_affecting")]
    pub mirror_affecting: Vec<String>,
}

impl Default for SecuritySettings {
    fn default() -> Self {
        Self {
            allowed_commands: default_allowed_commands(),
            blocked_commands: default_blocked_commands(),
            mirror_affecting: default_mirror_affecting(),
        }
    }
}

fn default_allowed_commands() -> Vec<String> {
    ["shell", "pull", "push", "install", "uninstall"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_blocked_commands() -> Vec<String> {
    ["rm -rf", "format", "dd", "fastboot"]
        .into_iter()
        .map(String::from)
        .collect()
}

fn default_mirror_affecting() -> Vec<String> {
    ["reboot", "root", "unroot", "tcpip", "usb", "shell wm"]
        .into_iter()
        .map(String::from)
        .collect()
}

/// Liveness polling
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct MonitorSettings {
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,

    /// Consecutive missed polls before an online device is marked offline
    #[serde(default = "default_offline_after")]
    pub offline_after: u32,
}

impl Default for MonitorSettings {
    fn default() -> Self {
        Self {
            enabled: true,
            interval_ms: default_interval_ms(),
            offline_after: default_offline_after(),
        }
    }
}

impl MonitorSettings {
    pub fn interval(&self) -> Duration {
        Duration::from_millis(self.interval_ms.max(1))
    }
}

fn default_true() -> bool {
    true
}

fn default_interval_ms() -> u64 {
    3_000
}

fn default_offline_after() -> u32 {
    3
}

/// Broadcast hub
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct HubSettings {
    /// Per-observer queue depth; an observer whose queue fills is dropped
    #[serde(default = "default_observer_queue")]
    pub observer_queue: usize,
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            observer_queue: default_observer_queue(),
        }
    }
}

fn default_observer_queue() -> usize {
    256
}

/// File transfer
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct StorageSettings {
    /// Largest file `push_file` accepts, in bytes
    #[serde(default = "default_max_file_size")]
    pub max_file_size: u64,

    /// Where `pull_file` writes downloads
    #[serde(default = "default_download_path")]
    pub download_path: PathBuf,
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            max_file_size: default_max_file_size(),
            download_path: default_download_path(),
        }
    }
}

fn default_max_file_size() -> u64 {
    100 * 1024 * 1024
}

fn default_download_path() -> PathBuf {
    PathBuf::from("./downloads")
}
