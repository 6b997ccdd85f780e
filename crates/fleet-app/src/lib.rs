//! # fleet-app - Device Orchestrator
//!
//! Owns device lifecycle state and everything built on it: the device
//! registry, mirror sessions, the command gateway, the broadcast hub and the
//! liveness monitor.
//!
//! Depends on [`fleet_core`] for domain types and on [`fleet_adapter`] for
//! the device tool boundary. All components are generic over
//! [`DeviceAdapter`](fleet_adapter::DeviceAdapter), so tests run against a
//! scripted adapter.
//!
//! ## Public API
//!
//! ### Facade
//! - [`Fleet`] - Builds and wires every component from [`Settings`]
//!
//! ### Components
//! - [`Registry`] - Per-device state machine with coalesced connects
//! - [`MirrorManager`] - One capture process per device, shared by observers
//! - [`CommandGateway`] - Policy-checked, time-bounded command execution
//! - [`Hub`] - Ordered, isolated fan-out of events to observers
//! - [`DeviceMonitor`] - Periodic liveness polling
//!
//! ### Configuration
//! - [`Settings`] - Parsed `.fleet/config.toml`
//! - [`load_settings()`] / [`init_config_dir()`]

pub mod config;
pub mod fleet;
pub mod gateway;
pub mod hub;
pub mod mirror;
pub mod monitor;
pub mod policy;
pub mod registry;

pub use config::{init_config_dir, load_settings, load_settings_file, Settings};
pub use fleet::Fleet;
pub use gateway::{BatchOutcome, CommandGateway, DEFAULT_REMOTE_DIR};
pub use hub::{Hub, Observer};
pub use mirror::{MirrorManager, SessionHandle};
pub use monitor::{DeviceMonitor, PollReport};
pub use policy::CommandPolicy;
pub use registry::{Registry, TeardownHook};
