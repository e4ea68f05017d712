//! Observing the driver's behaviour: request and connection metrics.
//!
//! Structured logs are emitted through `tracing` throughout the crate; install
//! a subscriber to see them.

pub mod metrics;
