//! Headless mode - NDJSON event output
//!
//! `fleetd` reads line commands on stdin and writes one JSON object per line
//! on stdout: every hub event the headless observer receives, and the
//! outcome of every command.
//!
//! # Example Output
//!
//! ```json
//! {"event":"device_snapshot","devices":[],"timestamp":1704700001000}
//! {"event":"device_changed","device":{"id":"R58M123ABC","status":"online",...},"timestamp":1704700002000}
//! {"event":"command_result","device_id":"R58M123ABC","command":"shell getprop ro.product.model","result":{"result":"success","stdout":"Pixel 7"},"timestamp":1704700003000}
//! ```

pub mod runner;

use std::io::{self, Write};
use std::path::Path;

use chrono::Utc;
use serde::Serialize;
use tracing::error;

use fleet_adapter::RemoteEntry;
use fleet_app::{BatchOutcome, SessionHandle};
use fleet_core::{CommandResult, Device, HubEvent, MirrorState};

pub use runner::run_headless;

/// Events emitted in headless mode
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum HeadlessEvent {
    /// Service is up and polling
    Ready {
        adb_version: Option<String>,
        timestamp: i64,
    },

    /// Full device list (on attach, and in answer to `list`)
    DeviceSnapshot { devices: Vec<Device>, timestamp: i64 },

    /// A device transitioned
    DeviceChanged { device: Device, timestamp: i64 },

    /// A mirror session changed state
    MirrorState {
        device_id: String,
        state: String,
        reason: Option<String>,
        timestamp: i64,
    },

    /// A mirror session ended
    MirrorStopped {
        device_id: String,
        reason: Option<String>,
        timestamp: i64,
    },

    /// A capture chunk arrived (payload size only)
    MirrorFrame {
        device_id: String,
        bytes: usize,
        timestamp: i64,
    },

    /// Live mirror sessions
    Sessions {
        sessions: Vec<SessionHandle>,
        timestamp: i64,
    },

    /// Outcome of `exec`, `tap`, `text`, ...
    CommandResult {
        device_id: String,
        command: String,
        result: CommandResult,
        timestamp: i64,
    },

    /// Outcome of `batch`, one entry per device in submission order
    BatchResult {
        command: String,
        outcomes: Vec<BatchOutcome>,
        timestamp: i64,
    },

    /// Remote directory listing
    Files {
        device_id: String,
        path: String,
        entries: Vec<RemoteEntry>,
        timestamp: i64,
    },

    /// A file was copied to or from a device
    FileTransferred {
        device_id: String,
        direction: TransferDirection,
        local: String,
        remote: String,
        timestamp: i64,
    },

    /// An operation failed
    Error {
        message: String,
        fatal: bool,
        timestamp: i64,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferDirection {
    Push,
    Pull,
}

impl HeadlessEvent {
    /// Emit this event to stdout as JSON
    pub fn emit(&self) {
        let json = match serde_json::to_string(self) {
            Ok(json) => json,
            Err(e) => {
                error!("Failed to serialize headless event: {}", e);
                return;
            }
        };

        let mut stdout = io::stdout().lock();
        if let Err(e) = writeln!(stdout, "{}", json) {
            error!("Failed to write headless event to stdout: {}", e);
            return;
        }

        if let Err(e) = stdout.flush() {
            error!("Failed to flush headless stdout: {}", e);
        }
    }

    /// Get current timestamp in milliseconds
    fn now() -> i64 {
        Utc::now().timestamp_millis()
    }

    // ─────────────────────────────────────────────────────────
    // Convenience constructors
    // ─────────────────────────────────────────────────────────

    pub fn ready(adb_version: Option<String>) -> Self {
        Self::Ready {
            adb_version,
            timestamp: Self::now(),
        }
    }

    pub fn device_snapshot(devices: Vec<Device>) -> Self {
        Self::DeviceSnapshot {
            devices,
            timestamp: Self::now(),
        }
    }

    pub fn sessions(sessions: Vec<SessionHandle>) -> Self {
        Self::Sessions {
            sessions,
            timestamp: Self::now(),
        }
    }

    pub fn command_result(device_id: &str, command: &str, result: CommandResult) -> Self {
        Self::CommandResult {
            device_id: device_id.to_string(),
            command: command.to_string(),
            result,
            timestamp: Self::now(),
        }
    }

    pub fn batch_result(command: &str, outcomes: Vec<BatchOutcome>) -> Self {
        Self::BatchResult {
            command: command.to_string(),
            outcomes,
            timestamp: Self::now(),
        }
    }

    pub fn files(device_id: &str, path: &str, entries: Vec<RemoteEntry>) -> Self {
        Self::Files {
            device_id: device_id.to_string(),
            path: path.to_string(),
            entries,
            timestamp: Self::now(),
        }
    }

    pub fn file_transferred(
        device_id: &str,
        direction: TransferDirection,
        local: &Path,
        remote: &str,
    ) -> Self {
        Self::FileTransferred {
            device_id: device_id.to_string(),
            direction,
            local: local.display().to_string(),
            remote: remote.to_string(),
            timestamp: Self::now(),
        }
    }

    pub fn error(message: String, fatal: bool) -> Self {
        Self::Error {
            message,
            fatal,
            timestamp: Self::now(),
        }
    }
}

impl From<HubEvent> for HeadlessEvent {
    fn from(event: HubEvent) -> Self {
        let timestamp = Self::now();
        match event {
            HubEvent::Snapshot { devices } => Self::DeviceSnapshot { devices, timestamp },
            HubEvent::DeviceChanged { device } => Self::DeviceChanged { device, timestamp },
            HubEvent::MirrorState { device_id, state } => {
                let reason = match &state {
                    MirrorState::Failed(reason) => Some(reason.clone()),
                    _ => None,
                };
                let state = match state {
                    MirrorState::Failed(_) => "failed".to_string(),
                    other => other.to_string(),
                };
                Self::MirrorState {
                    device_id,
                    state,
                    reason,
                    timestamp,
                }
            }
            HubEvent::MirrorStopped { device_id, reason } => Self::MirrorStopped {
                device_id,
                reason,
                timestamp,
            },
            HubEvent::MirrorFrame { device_id, payload } => Self::MirrorFrame {
                device_id,
                bytes: payload.len(),
                timestamp,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fleet_core::{DeviceStatus, RejectReason, Transport};

    fn to_value(event: &HeadlessEvent) -> serde_json::Value {
        let json = serde_json::to_string(event).expect("serialization failed");
        serde_json::from_str(&json).expect("invalid JSON")
    }

    #[test]
    fn test_device_changed_serialization() {
        let mut device = Device::new("R58M123ABC", Transport::Usb);
        device.status = DeviceStatus::Online;
        let value = to_value(&HeadlessEvent::from(HubEvent::DeviceChanged { device }));

        assert_eq!(value["event"], "device_changed");
        assert_eq!(value["device"]["id"], "R58M123ABC");
        assert!(value["timestamp"].is_number());
    }

    #[test]
    fn test_failed_mirror_state_carries_reason() {
        let value = to_value(&HeadlessEvent::from(HubEvent::MirrorState {
            device_id: "d1".into(),
            state: MirrorState::Failed("capture exited with Some(1)".into()),
        }));

        assert_eq!(value["event"], "mirror_state");
        assert_eq!(value["state"], "failed");
        assert_eq!(value["reason"], "capture exited with Some(1)");
    }

    #[test]
    fn test_frame_reports_size_only() {
        let value = to_value(&HeadlessEvent::from(HubEvent::MirrorFrame {
            device_id: "d1".into(),
            payload: bytes::Bytes::from_static(&[0u8; 12]),
        }));

        assert_eq!(value["event"], "mirror_frame");
        assert_eq!(value["bytes"], 12);
    }

    #[test]
    fn test_command_result_serialization() {
        let event = HeadlessEvent::command_result(
            "d1",
            "rm -rf /",
            CommandResult::rejected(RejectReason::Blocked),
        );
        let value = to_value(&event);

        assert_eq!(value["event"], "command_result");
        assert_eq!(value["device_id"], "d1");
        assert_eq!(value["result"]["result"], "rejected");
        assert_eq!(value["result"]["reason"], "blocked");
    }

    #[test]
    fn test_error_serialization() {
        let value = to_value(&HeadlessEvent::error("adb not found".to_string(), true));

        assert_eq!(value["event"], "error");
        assert_eq!(value["message"], "adb not found");
        assert_eq!(value["fatal"], true);
    }
}
