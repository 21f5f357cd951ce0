//! Summaries of the window and persistent tiers.
//!
//! A snapshot is one pass over the window map plus the store's running
//! counters. Nothing here mutates either tier.

use serde::Serialize;

use crate::cache::entry::{LoadSource, LoadState, WindowEntry};
use crate::cache::store::StoreUsage;
use crate::sync::manager::SyncStatus;
use crate::transfer::fetcher::FetchStats;

/// Counts over the window map.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize)]
pub struct WindowStats {
    pub total: usize,

    /// Entries whose payload came from the persistent tier.
    pub cached: usize,

    pub loaded: usize,
    pub loading: usize,
    pub error: usize,

    /// Mean `load_latency_ms` over loaded entries.
    pub avg_load_latency_ms: f64,

    #[serde(skip)]
    latency_sum: u64,
    #[serde(skip)]
    latency_samples: u64,
}

impl WindowStats {
    pub fn add(&mut self, entry: &WindowEntry) {
        self.total += 1;
        match entry.state {
            LoadState::Loaded => {
                self.loaded += 1;
                if entry.source == Some(LoadSource::Persistent) {
                    self.cached += 1;
                }
                if let Some(latency) = entry.load_latency_ms {
                    self.latency_sum += latency;
                    self.latency_samples += 1;
                }
            }
            LoadState::Loading => self.loading += 1,
            LoadState::Error => self.error += 1,
            LoadState::Unloaded => {}
        }
        self.avg_load_latency_ms = if self.latency_samples == 0 {
            0.0
        } else {
            self.latency_sum as f64 / self.latency_samples as f64
        };
    }
}

impl<'a> FromIterator<&'a WindowEntry> for WindowStats {
    fn from_iter<I: IntoIterator<Item = &'a WindowEntry>>(iter: I) -> Self {
        let mut stats = WindowStats::default();
        for entry in iter {
            stats.add(entry);
        }
        stats
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StatsSnapshot {
    pub window: WindowStats,

    pub store_available: bool,
    pub store_bytes: u64,
    pub store_entries: usize,
    pub protected_entries: usize,

    /// Persistent-tier hits per read; absent until this process has read from the store.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hit_rate: Option<f64>,

    /// `1 - stored/original` across persisted payloads.
    pub compression_ratio: f64,

    pub fetch: FetchStats,
    pub sync: Option<SyncStatus>,
}

/// Combine the parts of a snapshot. `usage` is `None` when no store is open.
pub fn summarize(
    window: WindowStats,
    usage: Option<StoreUsage>,
    available: bool,
    fetch: FetchStats,
    sync: Option<SyncStatus>,
) -> StatsSnapshot {
    let usage_or_default = usage.unwrap_or_default();
    StatsSnapshot {
        window,
        store_available: usage.is_some() && available,
        store_bytes: usage_or_default.total_bytes,
        store_entries: usage_or_default.total_entries,
        protected_entries: usage_or_default.protected_entries,
        hit_rate: (usage_or_default.gets > 0).then(|| usage_or_default.hit_rate()),
        compression_ratio: usage_or_default.compression_ratio(),
        fetch,
        sync,
    }
}
