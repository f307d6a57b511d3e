//! Application boundary.
//!
//! The runtime core (cells, registry, backoff policy, orchestrator) talks
//! to the chip exclusively through the **port traits** defined in
//! [`ports`], keeping it fully testable without real peripherals.

pub mod ports;
