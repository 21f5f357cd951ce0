//! Prometheus gauges for a [`StatsSnapshot`].

use prometheus::{Gauge, IntGauge, IntGaugeVec, Opts, Registry, TextEncoder};

use crate::stats::aggregator::StatsSnapshot;

/// Gauges registered on a private registry, refreshed from snapshots.
pub struct CacheMetrics {
    registry: Registry,

    /// Window entries by state - labels: state
    window_entries: IntGaugeVec,

    store_bytes: IntGauge,
    store_entries: IntGauge,
    protected_entries: IntGauge,
    store_available: IntGauge,
    hit_rate: Gauge,
    compression_ratio: Gauge,
    avg_load_latency_ms: Gauge,
    fetch_in_flight: IntGauge,
    pending_uploads: IntGauge,
}

impl CacheMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new_custom(Some("image_cache".to_string()), None)?;

        let window_entries = IntGaugeVec::new(
            Opts::new("window_entries", "Window entries by load state"),
            &["state"],
        )?;
        let store_bytes = IntGauge::new("store_bytes", "Stored bytes in the persistent tier")?;
        let store_entries = IntGauge::new("store_entries", "Entries in the persistent tier")?;
        let protected_entries =
            IntGauge::new("store_protected_entries", "High priority persistent entries")?;
        let store_available =
            IntGauge::new("store_available", "1 while the persistent tier is reachable")?;
        let hit_rate = Gauge::new("store_hit_rate", "Persistent tier hits per read")?;
        let compression_ratio =
            Gauge::new("compression_ratio", "1 - stored/original bytes")?;
        let avg_load_latency_ms = Gauge::new(
            "avg_load_latency_ms",
            "Mean load latency over loaded window entries",
        )?;
        let fetch_in_flight = IntGauge::new("fetch_in_flight", "Fetches currently in flight")?;
        let pending_uploads = IntGauge::new("pending_uploads", "Items awaiting upload")?;

        registry.register(Box::new(window_entries.clone()))?;
        registry.register(Box::new(store_bytes.clone()))?;
        registry.register(Box::new(store_entries.clone()))?;
        registry.register(Box::new(protected_entries.clone()))?;
        registry.register(Box::new(store_available.clone()))?;
        registry.register(Box::new(hit_rate.clone()))?;
        registry.register(Box::new(compression_ratio.clone()))?;
        registry.register(Box::new(avg_load_latency_ms.clone()))?;
        registry.register(Box::new(fetch_in_flight.clone()))?;
        registry.register(Box::new(pending_uploads.clone()))?;

        Ok(Self {
            registry,
            window_entries,
            store_bytes,
            store_entries,
            protected_entries,
            store_available,
            hit_rate,
            compression_ratio,
            avg_load_latency_ms,
            fetch_in_flight,
            pending_uploads,
        })
    }

    pub fn observe(&self, snapshot: &StatsSnapshot) {
        let w = &snapshot.window;
        for (state, count) in [
            ("total", w.total),
            ("cached", w.cached),
            ("loaded", w.loaded),
            ("loading", w.loading),
            ("error", w.error),
        ] {
            self.window_entries
                .with_label_values(&[state])
                .set(count as i64);
        }

        self.store_bytes.set(snapshot.store_bytes as i64);
        self.store_entries.set(snapshot.store_entries as i64);
        self.protected_entries.set(snapshot.protected_entries as i64);
        self.store_available.set(i64::from(snapshot.store_available));
        self.hit_rate.set(snapshot.hit_rate.unwrap_or(f64::NAN));
        self.compression_ratio.set(snapshot.compression_ratio);
        self.avg_load_latency_ms.set(w.avg_load_latency_ms);
        self.fetch_in_flight.set(snapshot.fetch.in_flight as i64);
        self.pending_uploads.set(
            snapshot
                .sync
                .as_ref()
                .map(|s| s.pending_count as i64)
                .unwrap_or(0),
        );
    }

    /// Text exposition of the current gauge values.
    pub fn render(&self) -> prometheus::Result<String> {
        TextEncoder::new().encode_to_string(&self.registry.gather())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stats::aggregator::{summarize, WindowStats};
    use crate::cache::store::StoreUsage;
    use crate::transfer::fetcher::FetchStats;

    #[test]
    fn test_render_contains_gauges() {
        let metrics = CacheMetrics::new().unwrap();
        let snapshot = summarize(
            WindowStats::default(),
            Some(StoreUsage {
                total_bytes: 1234,
                total_entries: 2,
                ..Default::default()
            }),
            true,
            FetchStats::default(),
            None,
        );
        metrics.observe(&snapshot);

        let text = metrics.render().unwrap();
        assert!(text.contains("image_cache_store_bytes 1234"));
        assert!(text.contains("image_cache_store_entries 2"));
        assert!(text.contains("image_cache_window_entries{state=\"loaded\"} 0"));
        assert!(text.contains("image_cache_store_hit_rate NaN"));
    }
}
