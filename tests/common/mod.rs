//! Shared fixtures for the integration tests.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::io::Cursor;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use image::{DynamicImage, ImageFormat, Rgb, RgbImage};
use parking_lot::Mutex;

use image_cache_tier::config::{CacheBudget, Config, FetchConfig, StoreConfig};
use image_cache_tier::transfer::source::{ResourceSource, SourceError};

/// A scripted source: per-key call counts, optional latency and failing keys.
#[derive(Default)]
pub struct MockSource {
    pub delay: Duration,
    failing: Mutex<HashSet<String>>,
    payloads: Mutex<HashMap<String, Bytes>>,
    calls: Mutex<HashMap<String, usize>>,
    active: AtomicUsize,
    pub max_active: AtomicUsize,
}

impl MockSource {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn with_delay(delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            delay,
            ..Default::default()
        })
    }

    pub fn fail(&self, key: &str) {
        self.failing.lock().insert(key.to_string());
    }

    pub fn heal(&self, key: &str) {
        self.failing.lock().remove(key);
    }

    pub fn serve(&self, key: &str, payload: impl Into<Bytes>) {
        self.payloads.lock().insert(key.to_string(), payload.into());
    }

    pub fn calls(&self, key: &str) -> usize {
        self.calls.lock().get(key).copied().unwrap_or(0)
    }

    pub fn total_calls(&self) -> usize {
        self.calls.lock().values().sum()
    }
}

#[async_trait]
impl ResourceSource for MockSource {
    async fn fetch(&self, key: &str) -> Result<Bytes, SourceError> {
        *self.calls.lock().entry(key.to_string()).or_insert(0) += 1;
        let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now, Ordering::SeqCst);

        if !self.delay.is_zero() {
            tokio::time::sleep(self.delay).await;
        }
        self.active.fetch_sub(1, Ordering::SeqCst);

        if self.failing.lock().contains(key) {
            return Err(SourceError::Status(503));
        }
        let payload = self.payloads.lock().get(key).cloned();
        Ok(payload.unwrap_or_else(|| Bytes::from(format!("payload for {key}"))))
    }
}

/// A PNG with enough detail that re-encoding is not trivially tiny.
pub fn sample_png(width: u32, height: u32) -> Vec<u8> {
    let img = RgbImage::from_fn(width, height, |x, y| {
        Rgb([(x * 7 % 256) as u8, (y * 5 % 256) as u8, ((x ^ y) % 256) as u8])
    });
    let mut buf = Vec::new();
    DynamicImage::ImageRgb8(img)
        .write_to(&mut Cursor::new(&mut buf), ImageFormat::Png)
        .expect("encode sample png");
    buf
}

/// A config rooted at `dir` with fast retries.
pub fn test_config(dir: &Path, budget: CacheBudget) -> Config {
    Config {
        budget,
        store: StoreConfig {
            path: dir.to_path_buf(),
            map_size_mb: 64,
        },
        fetch: FetchConfig {
            retry_jitter_ms: 0,
            ..Default::default()
        },
        ..Default::default()
    }
}

pub fn fast_budget() -> CacheBudget {
    CacheBudget {
        retry_delay_ms: 1,
        ..Default::default()
    }
}

pub fn keys(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("img-{i:02}")).collect()
}

/// Poll `cond` until it holds, yielding to the runtime between checks.
pub async fn eventually(mut cond: impl FnMut() -> bool) -> bool {
    for _ in 0..500 {
        if cond() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    cond()
}
