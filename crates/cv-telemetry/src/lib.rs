//! Telemetry for covey agents.
//!
//! - **Logging**: human-readable and JSON output via `tracing-subscriber`
//! - **Metrics**: counters, gauges and histograms with Prometheus text export
//! - **Tracing**: trace/span id generation for correlating group traffic

pub mod logging;
pub mod metrics;
pub mod tracing_setup;
