//! File-based tracing setup for `fleetd`
//!
//! The daemon's stdout carries the NDJSON event stream, so nothing from
//! `tracing` may ever reach it. All diagnostics go to a daily-rolled
//! `fleetd.log` instead.
//!
//! Two environment variables steer it:
//! - `FLEET_LOG` takes an `EnvFilter` directive (`debug`, `fleet_app::mirror=trace`)
//! - `FLEET_LOG_DIR` moves the log directory away from the platform data dir

use std::path::{Path, PathBuf};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::error::Result;

const LOG_FILE: &str = "fleetd.log";
const DEFAULT_DIRECTIVES: &str = "device_fleet=info,fleet_app=info,fleet_adapter=info,warn";

/// Install the global subscriber writing to the rolling log file
pub fn init() -> Result<()> {
    let log_dir = log_directory(std::env::var_os("FLEET_LOG_DIR").map(PathBuf::from));
    std::fs::create_dir_all(&log_dir)?;

    let file_appender = RollingFileAppender::new(Rotation::DAILY, &log_dir, LOG_FILE);
    let env_filter =
        EnvFilter::try_from_env("FLEET_LOG").unwrap_or_else(|_| EnvFilter::new(DEFAULT_DIRECTIVES));

    tracing_subscriber::registry()
        .with(env_filter)
        .with(
            fmt::layer()
                .with_writer(file_appender)
                .with_ansi(false)
                .with_target(true)
                .with_file(true)
                .with_line_number(true)
                .with_timer(fmt::time::ChronoLocal::new(
                    "%Y-%m-%d %H:%M:%S%.3f".to_string(),
                )),
        )
        .init();

    tracing::info!(
        pid = std::process::id(),
        log_file = %log_dir.join(LOG_FILE).display(),
        "fleetd starting"
    );

    Ok(())
}

/// Where log files land: the override if given, else `<data dir>/device-fleet/logs`
pub fn log_directory(override_dir: Option<PathBuf>) -> PathBuf {
    override_dir.unwrap_or_else(|| default_root().join("device-fleet").join("logs"))
}

fn default_root() -> PathBuf {
    dirs::data_local_dir().unwrap_or_else(|| Path::new(".").to_path_buf())
}
