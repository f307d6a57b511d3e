//! iotnode device runtime library.
//!
//! Exposes the runtime core for integration testing and for firmware
//! binaries.  All ESP-IDF-specific code is guarded by
//! `#[cfg(target_os = "espidf")]` within each module; the host build
//! swaps in simulations.

#![deny(unused_must_use)]

pub mod app;
pub mod api;
pub mod backoff;
pub mod config;
pub mod error;
pub mod logger;
pub mod persistent;
pub mod remote_config;
pub mod runtime;
pub mod telemetry;
pub mod util;

pub mod adapters;
pub mod drivers;

pub use error::{Error, Result};
pub use runtime::{CycleEnd, DeviceRuntime, Platform};
