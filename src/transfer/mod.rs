//! Getting payloads from the network.
//!
//! - [`source`]: single-attempt resource sources (HTTP)
//! - [`fetcher`]: deduplicated, retried fetches with persistent fallback

pub mod fetcher;
pub mod source;
