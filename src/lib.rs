//! image-cache-tier: a dual-tier image cache.
//!
//! Keeps the images around a viewing cursor warm in memory and backs them with
//! a bounded, compressed, priority-evicted store on disk, so a collection stays
//! browsable offline:
//!   network → window (hot, in memory) → persistent store (LMDB, compressed)
//!
//! Start from [`CacheManager`].

pub mod cache;
pub mod config;
pub mod stats;
pub mod sync;
pub mod transfer;

pub use cache::entry::{FetchPriority, LoadSource, LoadState, Priority, ResourceKey, WindowEntry};
pub use cache::manager::{CacheError, CacheManager};
pub use config::{CacheBudget, Config};
pub use stats::aggregator::StatsSnapshot;
