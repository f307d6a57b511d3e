//! Peripheral drivers that are not behind a port.

pub mod watchdog;
