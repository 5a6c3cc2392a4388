//! fleetpatchd internals shared by the binary and its regression tests.

pub mod config;
pub mod ops;
