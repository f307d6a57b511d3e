//! Integration test driver for `tests/integration/` submodule.
//!
//! Each `mod` below maps to a file that exercises a subsystem against
//! mock ports.  All tests run on the host (x86_64) with no real hardware
//! required; [`mock_platform::Rig`] simulates one device across boots.

mod config_sync_tests;
mod persistence_tests;
mod runtime_tests;
