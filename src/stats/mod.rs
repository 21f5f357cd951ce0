//! Cache statistics.
//!
//! - [`aggregator`]: point-in-time summary of both tiers
//! - [`metrics`]: Prometheus exposition of a summary

pub mod aggregator;
pub mod metrics;
