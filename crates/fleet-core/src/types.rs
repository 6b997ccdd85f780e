//! Core domain type definitions

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Stable device identifier, assigned at first discovery or connect request
pub type DeviceId = String;

/// How the host reaches a device
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Transport {
    Usb,
    Network { address: String },
}

impl Transport {
    /// Infer the transport from an adb serial (`host:port` serials are TCP/IP devices)
    pub fn from_serial(serial: &str) -> Self {
        match serial.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() && port.parse::<u16>().is_ok() => {
                Transport::Network {
                    address: serial.to_string(),
                }
            }
            _ => Transport::Usb,
        }
    }

    pub fn is_network(&self) -> bool {
        matches!(self, Transport::Network { .. })
    }
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Usb => write!(f, "usb"),
            Transport::Network { address } => write!(f, "network({})", address),
        }
    }
}

/// Device lifecycle status. Exactly one at a time.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(tag = "status", content = "reason", rename_all = "snake_case")]
pub enum DeviceStatus {
    #[default]
    Disconnected,
    /// Transient: resolves to `Online` or `Error` within the connect timeout
    Connecting,
    Online,
    /// Expected, recoverable loss of liveness (monitor-driven)
    Offline,
    /// Reserved for explicit operation failures
    Error(String),
}

impl DeviceStatus {
    pub fn is_online(&self) -> bool {
        matches!(self, DeviceStatus::Online)
    }

    pub fn is_transitional(&self) -> bool {
        matches!(self, DeviceStatus::Connecting)
    }

    pub fn label(&self) -> &'static str {
        match self {
            DeviceStatus::Disconnected => "disconnected",
            DeviceStatus::Connecting => "connecting",
            DeviceStatus::Online => "online",
            DeviceStatus::Offline => "offline",
            DeviceStatus::Error(_) => "error",
        }
    }
}

impl fmt::Display for DeviceStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeviceStatus::Error(reason) => write!(f, "error({})", reason),
            other => f.write_str(other.label()),
        }
    }
}

/// Best-effort device details; any field may be missing or stale
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceMetadata {
    pub name: Option<String>,
    pub model: Option<String>,
    pub os_version: Option<String>,
    /// `WIDTHxHEIGHT`
    pub resolution: Option<String>,
    /// `0..=100`, set through [`DeviceMetadata::set_battery_percent`]
    pub battery_percent: Option<u8>,
    /// `0..=5`, set through [`DeviceMetadata::set_signal_level`]
    pub signal_level: Option<u8>,
}

impl DeviceMetadata {
    pub const MAX_SIGNAL: u8 = 5;

    /// Clamped to `0..=100`
    pub fn set_battery_percent(&mut self, value: Option<u32>) {
        self.battery_percent = value.map(|v| v.min(100) as u8);
    }

    /// Clamped to `0..=5`
    pub fn set_signal_level(&mut self, value: Option<u32>) {
        self.signal_level = value.map(|v| v.min(Self::MAX_SIGNAL as u32) as u8);
    }

    pub fn with_battery(mut self, value: u32) -> Self {
        self.set_battery_percent(Some(value));
        self
    }

    pub fn with_signal(mut self, value: u32) -> Self {
        self.set_signal_level(Some(value));
        self
    }

    /// Fill fields missing here from `other`
    pub fn merged_with(mut self, other: &DeviceMetadata) -> Self {
        self.name = self.name.or_else(|| other.name.clone());
        self.model = self.model.or_else(|| other.model.clone());
        self.os_version = self.os_version.or_else(|| other.os_version.clone());
        self.resolution = self.resolution.or_else(|| other.resolution.clone());
        self.battery_percent = self.battery_percent.or(other.battery_percent);
        self.signal_level = self.signal_level.or(other.signal_level);
        self
    }

    pub fn is_empty(&self) -> bool {
        *self == DeviceMetadata::default()
    }
}

/// A device known to the registry
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Device {
    pub id: DeviceId,
    pub transport: Transport,
    pub status: DeviceStatus,
    pub metadata: DeviceMetadata,
    pub last_seen: Option<DateTime<Utc>>,
}

impl Device {
    pub fn new(id: impl Into<DeviceId>, transport: Transport) -> Self {
        Self {
            id: id.into(),
            transport,
            status: DeviceStatus::Disconnected,
            metadata: DeviceMetadata::default(),
            last_seen: None,
        }
    }

    /// The adb serial used to address this device
    pub fn serial(&self) -> &str {
        match &self.transport {
            Transport::Usb => &self.id,
            Transport::Network { address } => address,
        }
    }

    pub fn display_name(&self) -> &str {
        self.metadata
            .name
            .as_deref()
            .or(self.metadata.model.as_deref())
            .unwrap_or(&self.id)
    }

    pub fn touch(&mut self) {
        self.last_seen = Some(Utc::now());
    }
}

/// State reported by the adapter for a device it can see
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdapterState {
    /// Attached and authorized (adb `device`)
    Ready,
    Offline,
    Unauthorized,
    Unknown,
}

impl AdapterState {
    pub fn from_adb(state: &str) -> Self {
        match state {
            "device" => AdapterState::Ready,
            "offline" => AdapterState::Offline,
            "unauthorized" => AdapterState::Unauthorized,
            _ => AdapterState::Unknown,
        }
    }

    /// Registry status a monitor should observe for this adapter state
    pub fn observed_status(self) -> DeviceStatus {
        match self {
            AdapterState::Ready => DeviceStatus::Online,
            _ => DeviceStatus::Offline,
        }
    }
}

/// A device as seen by the external tool
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub serial: String,
    pub state: AdapterState,
    pub metadata: DeviceMetadata,
}

impl DeviceInfo {
    pub fn transport(&self) -> Transport {
        Transport::from_serial(&self.serial)
    }
}

/// Mirror session lifecycle
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum MirrorState {
    Starting,
    Streaming,
    Stopping,
    Stopped,
    Failed(String),
}

impl MirrorState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, MirrorState::Stopped | MirrorState::Failed(_))
    }
}

impl fmt::Display for MirrorState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MirrorState::Starting => write!(f, "starting"),
            MirrorState::Streaming => write!(f, "streaming"),
            MirrorState::Stopping => write!(f, "stopping"),
            MirrorState::Stopped => write!(f, "stopped"),
            MirrorState::Failed(reason) => write!(f, "failed({})", reason),
        }
    }
}

/// Why the command gateway refused a command
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RejectReason {
    DeviceNotFound,
    DeviceOffline,
    Blocked,
    NotAllowed,
    EmptyCommand,
}

impl fmt::Display for RejectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RejectReason::DeviceNotFound => "device not found",
            RejectReason::DeviceOffline => "device offline",
            RejectReason::Blocked => "blocked",
            RejectReason::NotAllowed => "not allowed",
            RejectReason::EmptyCommand => "empty command",
        })
    }
}

/// Outcome of a gateway command. Ephemeral: never retained by the gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", rename_all = "snake_case")]
pub enum CommandResult {
    Success {
        stdout: String,
    },
    Failure {
        exit_code: Option<i32>,
        stderr: String,
    },
    Rejected {
        reason: RejectReason,
    },
    Timeout,
}

impl CommandResult {
    pub fn rejected(reason: RejectReason) -> Self {
        CommandResult::Rejected { reason }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, CommandResult::Success { .. })
    }
}

/// Output of a finished one-shot tool invocation
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            exit_code: Some(exit_code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Identifier of an attached observer (dashboard client, headless stdout, ...)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ObserverId(u64);

static OBSERVER_ID_COUNTER: AtomicU64 = AtomicU64::new(1);

impl ObserverId {
    /// Generate a new unique observer ID
    pub fn next() -> Self {
        ObserverId(OBSERVER_ID_COUNTER.fetch_add(1, Ordering::SeqCst))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ObserverId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "obs-{}", self.0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_from_serial() {
        assert_eq!(Transport::from_serial("R58M123ABC"), Transport::Usb);
        assert_eq!(
            Transport::from_serial("192.168.1.20:5555"),
            Transport::Network {
                address: "192.168.1.20:5555".into()
            }
        );
        // emulator serials carry no port separator
        assert_eq!(Transport::from_serial("emulator-5554"), Transport::Usb);
        assert_eq!(Transport::from_serial("weird:name"), Transport::Usb);
    }

    #[test]
    fn test_device_serial_follows_transport() {
        let usb = Device::new("R58M", Transport::Usb);
        assert_eq!(usb.serial(), "R58M");

        let net = Device::new(
            "living-room",
            Transport::Network {
                address: "10.0.0.5:5555".into(),
            },
        );
        assert_eq!(net.serial(), "10.0.0.5:5555");
    }

    #[test]
    fn test_metadata_clamps_ranges() {
        let meta = DeviceMetadata::default().with_battery(250).with_signal(9);
        assert_eq!(meta.battery_percent, Some(100));
        assert_eq!(meta.signal_level, Some(5));

        let meta = DeviceMetadata::default().with_battery(42).with_signal(3);
        assert_eq!(meta.battery_percent, Some(42));
        assert_eq!(meta.signal_level, Some(3));
    }

    #[test]
    fn test_metadata_merge_keeps_fresh_values() {
        let stale = DeviceMetadata {
            model: Some("Pixel 6".into()),
            os_version: Some("13".into()),
            ..Default::default()
        }
        .with_battery(10);
        let fresh = DeviceMetadata {
            os_version: Some("14".into()),
            ..Default::default()
        }
        .merged_with(&stale);

        assert_eq!(fresh.os_version.as_deref(), Some("14"));
        assert_eq!(fresh.model.as_deref(), Some("Pixel 6"));
        assert_eq!(fresh.battery_percent, Some(10));
    }

    #[test]
    fn test_status_display() {
        assert_eq!(DeviceStatus::Online.to_string(), "online");
        assert_eq!(
            DeviceStatus::Error("timeout".into()).to_string(),
            "error(timeout)"
        );
        assert!(DeviceStatus::Connecting.is_transitional());
        assert!(!DeviceStatus::Offline.is_transitional());
    }

    #[test]
    fn test_status_serializes_with_reason() {
        let json = serde_json::to_string(&DeviceStatus::Error("timeout".into())).unwrap();
        assert_eq!(json, r#"{"status":"error","reason":"timeout"}"#);
        let json = serde_json::to_string(&DeviceStatus::Online).unwrap();
        assert_eq!(json, r#"{"status":"online"}"#);
    }

    #[test]
    fn test_adapter_state_mapping() {
        assert_eq!(AdapterState::from_adb("device"), AdapterState::Ready);
        assert_eq!(
            AdapterState::from_adb("unauthorized").observed_status(),
            DeviceStatus::Offline
        );
        assert_eq!(
            AdapterState::from_adb("device").observed_status(),
            DeviceStatus::Online
        );
    }

    #[test]
    fn test_reject_reason_text() {
        assert_eq!(RejectReason::Blocked.to_string(), "blocked");
        assert_eq!(RejectReason::DeviceOffline.to_string(), "device offline");
        assert_eq!(RejectReason::NotAllowed.to_string(), "not allowed");
    }

    #[test]
    fn test_observer_ids_are_unique() {
        let a = ObserverId::next();
        let b = ObserverId::next();
        assert_ne!(a, b);
        assert!(b > a);
    }
}
