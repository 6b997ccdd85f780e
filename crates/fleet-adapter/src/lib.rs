//! # fleet-adapter - Device Tool Adapter
//!
//! Everything that talks to the external device tool (`adb`): one-shot
//! invocations with mandatory timeouts, long-running capture processes, and
//! parsing of the tool's textual output.
//!
//! Depends on [`fleet_core`] for domain types and error handling.
//!
//! ## Public API
//!
//! ### Adapter Contract
//! - [`DeviceAdapter`] - Async operations the orchestrator consumes
//! - [`AdbAdapter`] - Implementation backed by the `adb` binary
//! - [`CaptureOptions`], [`RemoteEntry`] - Parameters and results
//!
//! ### Process Management
//! - [`CaptureProcess`] - Exclusive handle to a capture subprocess
//! - [`run_tool()`] - Run a one-shot tool invocation with a deadline
//!
//! ### Input
//! - [`InputAction`] - Taps, swipes, text and key events
//!
//! ### Platform Utilities
//! - [`ToolAvailability`] - Check that adb is installed and runnable

pub mod adapter;
pub mod adb;
pub mod devices;
pub mod input;
pub mod process;
#[cfg(any(test, feature = "test-helpers"))]
pub mod test_utils;
pub mod tool;
pub mod tool_availability;

pub use adapter::{CaptureOptions, DeviceAdapter, RemoteEntry};
pub use adb::AdbAdapter;
pub use input::InputAction;
pub use process::CaptureProcess;
#[cfg(any(test, feature = "test-helpers"))]
pub use process::CaptureScript;
pub use tool::{run_tool, run_tool_checked};
pub use tool_availability::ToolAvailability;
