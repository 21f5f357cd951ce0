//! image-cache-tier: admin CLI for the dual-tier image cache.
//!
//! Inspects and drives the persistent tier described by the configuration
//! file: statistics, a one-off fetch through the full pipeline, reads and
//! clearing.

use std::sync::Arc;

use clap::Parser;
use tokio::sync::watch;
use tracing::info;

use image_cache_tier::cache::store::PersistentStore;
use image_cache_tier::config::{Cli, Command, Config};
use image_cache_tier::stats::aggregator::{summarize, WindowStats};
use image_cache_tier::stats::metrics::CacheMetrics;
use image_cache_tier::transfer::fetcher::FetchStats;
use image_cache_tier::transfer::source::HttpSource;
use image_cache_tier::{CacheBudget, CacheManager, FetchPriority};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments.
    let cli = Cli::parse();

    // Initialize tracing/logging.
    let filter = if cli.verbose {
        "image_cache_tier=debug"
    } else {
        "image_cache_tier=info"
    };

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with_target(true)
        .with_writer(std::io::stderr)
        .init();

    info!("image-cache-tier v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration.
    let config = Config::load(&cli.config)?;

    info!(
        store = %config.store.path.display(),
        max_bytes = config.budget.max_bytes,
        max_entries = config.budget.max_entries,
        priority_threshold = config.budget.priority_threshold,
        "Configuration loaded"
    );

    match cli.command {
        Command::Stats { prometheus } => stats(&config, prometheus),
        Command::Fetch { key } => fetch(&config, &key).await,
        Command::Get { key, out } => get(&config, &key, out.as_deref()),
        Command::Clear => {
            let (_budget_tx, store) = open_store(&config)?;
            store.clear()?;
            println!("cleared");
            Ok(())
        }
    }
}

/// The budget sender must outlive the store.
fn open_store(config: &Config) -> anyhow::Result<(watch::Sender<CacheBudget>, PersistentStore)> {
    let (budget_tx, budget_rx) = watch::channel(config.budget.clone());
    let store = PersistentStore::open(&config.store, config.compression.clone(), budget_rx)?;
    Ok((budget_tx, store))
}

fn stats(config: &Config, prometheus: bool) -> anyhow::Result<()> {
    let (_budget_tx, store) = open_store(config)?;
    let snapshot = summarize(
        WindowStats::default(),
        Some(store.usage()),
        true,
        FetchStats::default(),
        None,
    );

    if prometheus {
        let metrics = CacheMetrics::new()?;
        metrics.observe(&snapshot);
        print!("{}", metrics.render()?);
    } else {
        println!("{}", serde_json::to_string_pretty(&snapshot)?);
    }
    Ok(())
}

async fn fetch(config: &Config, key: &str) -> anyhow::Result<()> {
    let Some(base_url) = config.fetch.base_url.as_deref() else {
        anyhow::bail!("fetch.base_url is not configured");
    };
    let source = Arc::new(HttpSource::new(base_url)?);
    let cache = CacheManager::open(config, source)?;

    let fetched = cache
        .fetch(key, FetchPriority::High)
        .await
        .map_err(|_| anyhow::anyhow!("fetch of {key} was abandoned"))??;
    cache.wait_idle().await;

    println!(
        "{}",
        serde_json::json!({
            "key": fetched.key,
            "bytes": fetched.bytes.len(),
            "source": fetched.source,
            "natural_size": fetched.natural_size,
            "latency_ms": fetched.latency_ms,
            "attempts": fetched.attempts,
        })
    );
    cache.shutdown();
    Ok(())
}

fn get(config: &Config, key: &str, out: Option<&std::path::Path>) -> anyhow::Result<()> {
    let (_budget_tx, store) = open_store(config)?;
    let Some(found) = store.get(key)? else {
        anyhow::bail!("{key} is not in the persistent tier");
    };

    if let Some(path) = out {
        std::fs::write(path, &found.bytes)?;
        info!(path = %path.display(), bytes = found.bytes.len(), "Payload written");
        return Ok(());
    }

    let entry = &found.entry;
    println!(
        "{}",
        serde_json::json!({
            "key": entry.key,
            "size_bytes": entry.size_bytes,
            "decoded_bytes": found.bytes.len(),
            "access_count": entry.access_count,
            "priority": entry.priority,
            "last_accessed_at": entry.last_accessed_at,
            "metadata": entry.metadata,
        })
    );
    Ok(())
}
