//! Device Fleet
//!
//! Headless front-end for the device session orchestrator. The orchestration
//! itself lives in the `fleet-app` crate; this crate turns stdin commands
//! into [`fleet_app::Fleet`] calls and prints NDJSON events.

pub mod headless;

pub use headless::run_headless;
