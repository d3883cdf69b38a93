//! Logging setup for binaries and tests embedding the CDC engine.

pub mod tracing;
