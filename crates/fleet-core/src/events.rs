//! Event definitions: what observers receive, and what capture processes emit

use bytes::Bytes;

use crate::types::{Device, DeviceId, MirrorState};

/// Event delivered to attached observers through the broadcast hub
#[derive(Debug, Clone, PartialEq)]
pub enum HubEvent {
    /// Full device list; always the first event an observer receives
    Snapshot { devices: Vec<Device> },

    /// Post-transition snapshot of a single device
    DeviceChanged { device: Device },

    /// Mirror session changed state (targeted at the session's audience)
    MirrorState {
        device_id: DeviceId,
        state: MirrorState,
    },

    /// Mirror session ended, requested or not (targeted at the session's audience)
    MirrorStopped {
        device_id: DeviceId,
        /// `None` for a requested stop, the failure reason for a crash
        reason: Option<String>,
    },

    /// Opaque capture payload (targeted at current subscribers)
    MirrorFrame { device_id: DeviceId, payload: Bytes },
}

impl HubEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            HubEvent::Snapshot { .. } | HubEvent::DeviceChanged { .. } => EventKind::DeviceState,
            HubEvent::MirrorState { .. } | HubEvent::MirrorStopped { .. } => EventKind::Mirror,
            HubEvent::MirrorFrame { .. } => EventKind::Frames,
        }
    }

    pub fn device_id(&self) -> Option<&str> {
        match self {
            HubEvent::Snapshot { .. } => None,
            HubEvent::DeviceChanged { device } => Some(&device.id),
            HubEvent::MirrorState { device_id, .. }
            | HubEvent::MirrorStopped { device_id, .. }
            | HubEvent::MirrorFrame { device_id, .. } => Some(device_id),
        }
    }
}

/// Event categories an observer can register interest in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    DeviceState,
    Mirror,
    Frames,
}

/// Set of event kinds an observer wants
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interests {
    pub device_state: bool,
    pub mirror: bool,
    pub frames: bool,
}

impl Interests {
    pub fn all() -> Self {
        Self {
            device_state: true,
            mirror: true,
            frames: true,
        }
    }

    /// Device state and mirror lifecycle, no frame payloads
    pub fn without_frames() -> Self {
        Self {
            frames: false,
            ..Self::all()
        }
    }

    pub fn wants(&self, kind: EventKind) -> bool {
        match kind {
            EventKind::DeviceState => self.device_state,
            EventKind::Mirror => self.mirror,
            EventKind::Frames => self.frames,
        }
    }
}

impl Default for Interests {
    fn default() -> Self {
        Self::all()
    }
}

/// Output of a long-running capture process
#[derive(Debug, Clone, PartialEq)]
pub enum CaptureEvent {
    /// A chunk of stdout, relayed without decoding
    Frame(Bytes),

    /// A line of stderr
    Stderr(String),

    /// Process has exited; emitted exactly once
    Exited { code: Option<i32> },
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Transport;

    #[test]
    fn test_event_kinds() {
        let device = Device::new("d1", Transport::Usb);
        assert_eq!(
            HubEvent::DeviceChanged { device }.kind(),
            EventKind::DeviceState
        );
        assert_eq!(
            HubEvent::MirrorFrame {
                device_id: "d1".into(),
                payload: Bytes::from_static(b"x"),
            }
            .kind(),
            EventKind::Frames
        );
        assert_eq!(
            HubEvent::MirrorStopped {
                device_id: "d1".into(),
                reason: None,
            }
            .kind(),
            EventKind::Mirror
        );
    }

    #[test]
    fn test_interests_filter() {
        let interests = Interests::without_frames();
        assert!(interests.wants(EventKind::DeviceState));
        assert!(interests.wants(EventKind::Mirror));
        assert!(!interests.wants(EventKind::Frames));
        assert!(Interests::default().wants(EventKind::Frames));
    }

    #[test]
    fn test_device_id_of_event() {
        let event = HubEvent::MirrorState {
            device_id: "d9".into(),
            state: MirrorState::Streaming,
        };
        assert_eq!(event.device_id(), Some("d9"));
        assert_eq!(HubEvent::Snapshot { devices: vec![] }.device_id(), None);
    }
}
