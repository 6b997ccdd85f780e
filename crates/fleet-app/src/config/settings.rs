//! Settings parser for .fleet/config.toml

use std::path::Path;

use fleet_core::prelude::*;

use super::types::Settings;

const CONFIG_FILENAME: &str = "config.toml";
const FLEET_DIR: &str = ".fleet";

const DEFAULT_CONFIG: &str = r#"# Device Fleet Configuration

[adb]
path = "adb"                # Binary name on PATH or absolute path
command_timeout_ms = 30000  # Gateway commands and file transfers
connect_timeout_ms = 10000

[mirror]
max_size = 720              # Longest edge in pixels, 0 = native
bit_rate = 8000000
startup_timeout_ms = 5000
stop_grace_ms = 2000

[security]
# Leading adb subcommand a command may use (empty = allow all)
allowed_commands = ["shell", "pull", "push", "install", "uninstall"]
# Always refused, matched on whole words
blocked_commands = ["rm -rf", "format", "dd", "fastboot"]
# Serialized against mirror start/stop on the same device
mirror_affecting = ["reboot", "root", "unroot", "tcpip", "usb", "shell wm"]

[monitor]
enabled = true
interval_ms = 3000
offline_after = 3           # Missed polls before an online device goes offline

[hub]
observer_queue = 256        # Slow observers are dropped when their queue fills

[storage]
max_file_size = 104857600   # 100 MB
download_path = "./downloads"
"#;

/// Load settings from `.fleet/config.toml` under `base_path`.
///
/// A missing file yields defaults; a malformed file is logged and also
/// yields defaults.
pub fn load_settings(base_path: &Path) -> Settings {
    let config_path = base_path.join(FLEET_DIR).join(CONFIG_FILENAME);

    if !config_path.exists() {
        debug!("No config file at {:?}, using defaults", config_path);
        return Settings::default();
    }

    match std::fs::read_to_string(&config_path) {
        Ok(content) => match toml::from_str(&content) {
            Ok(settings) => {
                debug!("Loaded settings from {:?}", config_path);
                settings
            }
            Err(e) => {
                warn!("Failed to parse {:?}: {}", config_path, e);
                Settings::default()
            }
        },
        Err(e) => {
            warn!("Failed to read {:?}: {}", config_path, e);
            Settings::default()
        }
    }
}

/// Load settings from an explicit file; unlike [`load_settings`] a missing
/// or malformed file is an error.
pub fn load_settings_file(path: &Path) -> Result<Settings> {
    if !path.exists() {
        return Err(Error::ConfigNotFound {
            path: path.to_path_buf(),
        });
    }

    let content = std::fs::read_to_string(path)?;
    toml::from_str(&content)
        .map_err(|e| Error::config(format!("Failed to parse {}: {}", path.display(), e)))
}

/// Create `.fleet/config.toml` with commented defaults if it does not exist
pub fn init_config_dir(base_path: &Path) -> Result<()> {
    let fleet_dir = base_path.join(FLEET_DIR);

    if !fleet_dir.exists() {
        std::fs::create_dir_all(&fleet_dir)
            .map_err(|e| Error::config(format!("Failed to create .fleet dir: {}", e)))?;
    }

    let config_path = fleet_dir.join(CONFIG_FILENAME);
    if !config_path.exists() {
        std::fs::write(&config_path, DEFAULT_CONFIG)
            .map_err(|e| Error::config(format!("Failed to write config.toml: {}", e)))?;
        info!("Created default config at {:?}", config_path);
    }

    Ok(())
}
