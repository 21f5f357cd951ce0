//! Runtime configuration for image-cache-tier.
//!
//! Configuration can be loaded from a JSON file or constructed programmatically.
//! The [`CacheBudget`] section is the live-tunable part: it is handed to the
//! cache at construction and may be replaced later through
//! `CacheManager::update_budget`, taking effect on the next fetch/eviction cycle.

use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};

/// Command-line arguments.
#[derive(Parser, Debug, Clone)]
#[command(name = "image-cache-tier", about = "Inspect and drive the dual-tier image cache")]
pub struct Cli {
    /// Path to configuration file (JSON).
    #[arg(short, long, default_value = "config.json")]
    pub config: PathBuf,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Command,
}

/// Admin subcommands.
#[derive(Subcommand, Debug, Clone)]
pub enum Command {
    /// Print statistics for the persistent tier.
    Stats {
        /// Emit Prometheus text exposition instead of JSON.
        #[arg(long)]
        prometheus: bool,
    },
    /// Fetch a key through the full pipeline (network, then persist).
    Fetch {
        key: String,
    },
    /// Read a key from the persistent tier.
    Get {
        key: String,

        /// Write the payload to this file instead of printing its metadata.
        #[arg(short, long)]
        out: Option<PathBuf>,
    },
    /// Remove every persisted entry and reset access counts.
    Clear,
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Live-tunable cache budget.
    pub budget: CacheBudget,

    /// Persistent tier location and sizing.
    pub store: StoreConfig,

    /// Compression settings.
    pub compression: CompressionConfig,

    /// Network fetch settings.
    pub fetch: FetchConfig,
}

/// Budget shared by both tiers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheBudget {
    /// Maximum bytes held by the persistent tier (compressed size).
    pub max_bytes: u64,

    /// Maximum number of entries in the persistent tier.
    pub max_entries: usize,

    /// Re-encode quality in (0, 1].
    pub compression_quality: f32,

    /// Number of keys kept warm on each side of the cursor.
    pub window_radius: usize,

    /// Capacity of the in-memory window map before out-of-window entries are pruned.
    pub window_max_entries: usize,

    /// Total fetch attempts per request (minimum 1).
    pub retry_attempts: u32,

    /// Base delay between attempts, in milliseconds.
    pub retry_delay_ms: u64,

    /// Access count at which an entry becomes `High` priority.
    pub priority_threshold: u64,

    /// Reconcile automatically when coming back online and periodically while online.
    pub auto_sync: bool,

    /// Period of the online reconciliation pass.
    pub sync_interval_minutes: u64,
}

impl Default for CacheBudget {
    fn default() -> Self {
        Self {
            max_bytes: 100 * 1024 * 1024, // 100 MB
            max_entries: 1000,
            compression_quality: 0.8,
            window_radius: 2,
            window_max_entries: 50,
            retry_attempts: 3,
            retry_delay_ms: 1000,
            priority_threshold: 3,
            auto_sync: true,
            sync_interval_minutes: 5,
        }
    }
}

impl CacheBudget {
    pub fn sync_interval(&self) -> Duration {
        Duration::from_secs(self.sync_interval_minutes.max(1) * 60)
    }

    /// Attempt budget, never below one.
    pub fn attempts(&self) -> u32 {
        self.retry_attempts.max(1)
    }

    /// Reject budgets that cannot be honoured.
    pub fn validate(&self) -> anyhow::Result<()> {
        if !(self.compression_quality > 0.0 && self.compression_quality <= 1.0) {
            anyhow::bail!(
                "compression_quality must be in (0, 1], got {}",
                self.compression_quality
            );
        }
        if self.max_entries == 0 {
            anyhow::bail!("max_entries must be at least 1");
        }
        if self.priority_threshold < 2 {
            anyhow::bail!(
                "priority_threshold must be at least 2 (Medium starts at 2), got {}",
                self.priority_threshold
            );
        }
        Ok(())
    }
}

/// Persistent tier settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Directory holding the LMDB environment.
    pub path: PathBuf,

    /// LMDB map size in megabytes. Must exceed `max_bytes` with headroom for metadata.
    pub map_size_mb: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/tmp/image-cache"),
            map_size_mb: 512,
        }
    }
}

/// Compression pipeline settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CompressionConfig {
    /// Downscale images whose longer side exceeds this many pixels (None = keep size).
    pub max_dimension: Option<u32>,

    /// zstd level (1-22) for payloads that are not decodable images.
    pub zstd_level: i32,
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            max_dimension: None,
            zstd_level: 3,
        }
    }
}

/// Network fetch settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// Base URL for the HTTP source; the key is appended as a path segment.
    pub base_url: Option<String>,

    /// Per-attempt timeout in milliseconds.
    pub attempt_timeout_ms: u64,

    /// Upper bound of the exponential retry delay.
    pub max_retry_delay_ms: u64,

    /// Uniform jitter added to each retry delay.
    pub retry_jitter_ms: u64,

    /// Concurrent `Low` priority fetches; `High` fetches are not limited.
    pub low_priority_slots: usize,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            base_url: None,
            attempt_timeout_ms: 30_000,
            max_retry_delay_ms: 30_000,
            retry_jitter_ms: 250,
            low_priority_slots: 2,
        }
    }
}

impl FetchConfig {
    pub fn attempt_timeout(&self) -> Duration {
        Duration::from_millis(self.attempt_timeout_ms)
    }
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults for missing fields.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let config = if path.exists() {
            let data = std::fs::read_to_string(path)?;
            serde_json::from_str::<Config>(&data)?
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Config::default()
        };
        config.budget.validate()?;
        Ok(config)
    }
}
