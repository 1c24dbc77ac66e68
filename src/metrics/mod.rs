//! Metrics Module
//!
//! Prometheus counters for the relay and the HTTP endpoint that exports them.

pub mod collector;
pub mod server;

pub use collector::{Metrics, MetricsSnapshot};
pub use server::MetricsServer;
