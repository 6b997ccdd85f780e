//! Configuration file parsing for the device fleet
//!
//! Supports:
//! - `.fleet/config.toml` - Global settings

pub mod settings;
pub mod types;

pub use settings::{init_config_dir, load_settings, load_settings_file};
pub use types::*;
