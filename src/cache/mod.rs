//! The two cache tiers and their shared types.
//!
//! - [`entry`]: keys, priorities, window and persistent entry types
//! - [`window`]: in-memory window around a cursor
//! - [`ledger`]: durable per-key access counts
//! - [`store`]: LMDB-backed persistent tier
//! - [`durable`]: async access to the store with degraded-mode handling
//! - [`evictor`]: victim selection by (priority, last access)
//! - [`compressor`]: JPEG re-encoding and zstd for everything else
//! - [`manager`]: the facade tying both tiers together

pub mod compressor;
pub mod durable;
pub mod entry;
pub mod evictor;
pub mod ledger;
pub mod manager;
pub mod store;
pub mod window;
