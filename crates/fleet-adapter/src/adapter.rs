//! The boundary between the orchestrator and the external device tool

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use fleet_core::events::CaptureEvent;
use fleet_core::prelude::*;
use fleet_core::types::{DeviceInfo, DeviceMetadata, ExecOutput, Transport};

use crate::process::CaptureProcess;

/// Parameters for a screen capture stream
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaptureOptions {
    /// Longest edge in pixels; `0` keeps the native size
    pub max_size: u32,
    /// Bits per second
    pub bit_rate: u32,
}

impl Default for CaptureOptions {
    fn default() -> Self {
        Self {
            max_size: 720,
            bit_rate: 8_000_000,
        }
    }
}

/// One entry of a remote directory listing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RemoteEntry {
    pub name: String,
    pub is_dir: bool,
    pub size: Option<u64>,
    /// Raw `ls -l` permission column
    pub permissions: String,
}

/// Operations the orchestrator needs from the device tool.
///
/// Every call may block, fail, or hang; callers bound each call with their
/// own timeout. Implementations must be safe to call concurrently for
/// different devices.
#[trait_variant::make(DeviceAdapter: Send)]
pub trait LocalDeviceAdapter {
    /// Establish a session with a device and report what the tool sees
    async fn connect(&self, id: &str, transport: &Transport) -> Result<DeviceInfo>;

    /// Tear down the session (network devices are detached from the tool)
    async fn disconnect(&self, id: &str, transport: &Transport) -> Result<()>;

    /// Start a long-running capture whose output is relayed to `events`
    async fn start_capture(
        &self,
        serial: &str,
        options: &CaptureOptions,
        events: mpsc::Sender<CaptureEvent>,
    ) -> Result<CaptureProcess>;

    /// Run a one-shot command. `timeout` bounds the tool invocation itself.
    async fn exec(&self, serial: &str, command: &str, timeout: Duration) -> Result<ExecOutput>;

    /// Enumerate devices currently visible to the tool
    async fn list_devices(&self) -> Result<Vec<DeviceInfo>>;

    /// Best-effort metadata query (model, OS version, battery, ...)
    async fn describe(&self, serial: &str) -> Result<DeviceMetadata>;

    /// Copy a local file onto the device
    async fn push(&self, serial: &str, local: &Path, remote: &str, timeout: Duration)
        -> Result<()>;

    /// Copy a device file to the host
    async fn pull(&self, serial: &str, remote: &str, local: &Path, timeout: Duration)
        -> Result<()>;

    /// List a directory on the device
    async fn list_dir(&self, serial: &str, path: &str, timeout: Duration)
        -> Result<Vec<RemoteEntry>>;
}
