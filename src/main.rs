//! fleetd - headless Android device fleet service
//!
//! This is the binary entry point. All logic lives in the library.

use std::path::PathBuf;

use clap::Parser;
use tracing::info;

/// fleetd - connect, mirror and command a fleet of Android devices
#[derive(Parser, Debug)]
#[command(name = "fleetd")]
#[command(about = "Headless Android device fleet service (NDJSON on stdout)", long_about = None)]
struct Args {
    /// Directory holding `.fleet/config.toml`
    #[arg(value_name = "PATH")]
    path: Option<PathBuf>,

    /// Also emit a `mirror_frame` event per capture chunk
    #[arg(long)]
    frames: bool,

    /// Write a default `.fleet/config.toml` and exit
    #[arg(long)]
    init_config: bool,
}

#[tokio::main]
async fn main() -> color_eyre::Result<()> {
    color_eyre::install()?;
    let args = Args::parse();

    let base_path = args
        .path
        .unwrap_or_else(|| std::env::current_dir().unwrap_or_else(|_| PathBuf::from(".")));

    if args.init_config {
        fleet_app::init_config_dir(&base_path)?;
        eprintln!("Wrote {}", base_path.join(".fleet").join("config.toml").display());
        return Ok(());
    }

    fleet_core::logging::init()?;
    info!("fleetd {}", env!("CARGO_PKG_VERSION"));

    device_fleet::run_headless(&base_path, args.frames).await?;
    Ok(())
}
