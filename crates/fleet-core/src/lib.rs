//! # fleet-core - Core Domain Types
//!
//! Foundation crate for the device fleet orchestrator. Provides domain types,
//! the observer event model, error handling, and logging setup.
//!
//! This crate has **zero internal dependencies** -- it only depends on external
//! crates (serde, chrono, thiserror, tracing, bytes).
//!
//! ## Public API
//!
//! ### Domain Types (`types`)
//! - [`Device`] - A registry entry: id, transport, status, metadata, last seen
//! - [`DeviceStatus`] - Lifecycle status (Disconnected, Connecting, Online, Offline, Error)
//! - [`Transport`] - USB or network address
//! - [`DeviceInfo`] / [`AdapterState`] - What the external tool reports
//! - [`MirrorState`] - Mirror session lifecycle
//! - [`CommandResult`] / [`RejectReason`] - Command gateway outcomes
//! - [`ObserverId`] - Attached observer identity
//!
//! ### Events (`events`)
//! - [`HubEvent`] - Snapshot, device change, mirror lifecycle and frame events
//! - [`Interests`] / [`EventKind`] - Per-observer event filtering
//! - [`CaptureEvent`] - Output of a capture subprocess
//!
//! ### Error Handling (`error`)
//! - [`Error`] - Error enum with validation / recoverable / fatal classification
//! - [`Result`] - Type alias for `std::result::Result<T, Error>`
//!
//! ## Prelude
//!
//! Import commonly used types with:
//! ```rust
//! use fleet_core::prelude::*;
//! ```

pub mod error;
pub mod events;
pub mod logging;
pub mod types;

/// Prelude for common imports used throughout all fleet crates
pub mod prelude {
    pub use super::error::{Error, Result};
    pub use tracing::{debug, error, info, instrument, trace, warn};
}

// Re-export commonly used types at crate root for convenience
pub use error::{Error, Result};
pub use events::{CaptureEvent, EventKind, HubEvent, Interests};
pub use types::{
    AdapterState, CommandResult, Device, DeviceId, DeviceInfo, DeviceMetadata, DeviceStatus,
    ExecOutput, MirrorState, ObserverId, RejectReason, Transport,
};
