//! Telemetry setup shared by the calcmetric binaries.

pub mod tracing;
