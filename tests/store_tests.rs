//! Integration tests for the persistent tier.

mod common;

use std::io::Cursor;
use std::sync::Arc;

use bytes::Bytes;
use tempfile::TempDir;
use tokio::sync::watch;

use image_cache_tier::cache::entry::{NaturalSize, Priority, StoredFormat};
use image_cache_tier::cache::store::{PersistentStore, StoreError};
use image_cache_tier::config::{CacheBudget, CompressionConfig};
use image_cache_tier::{CacheError, CacheManager};

use common::{fast_budget, sample_png, test_config, MockSource};

fn open(
    dir: &TempDir,
    max_entries: usize,
    max_bytes: u64,
) -> (PersistentStore, watch::Sender<CacheBudget>) {
    let (tx, rx) = watch::channel(CacheBudget {
        max_entries,
        max_bytes,
        ..Default::default()
    });
    let store =
        PersistentStore::open_at(dir.path(), 64, CompressionConfig::default(), rx).unwrap();
    (store, tx)
}

fn stored_keys(store: &PersistentStore) -> Vec<String> {
    let mut keys: Vec<String> = store
        .eviction_order()
        .unwrap()
        .into_iter()
        .map(|(k, _)| k)
        .collect();
    keys.sort();
    keys
}

#[test]
fn test_oldest_low_evicted_first() {
    let tmp = TempDir::new().unwrap();
    let (store, _tx) = open(&tmp, 3, 1_000_000);

    for key in ["A", "B", "C"] {
        store.put(key, key.as_bytes(), None).unwrap();
        let read = store.get(key).unwrap().unwrap();
        assert_eq!(read.entry.access_count, 1);
        assert_eq!(read.entry.priority, Priority::Low);
    }

    store.ledger().record("D");
    let d = store.put("D", b"D", None).unwrap();
    assert_eq!(d.priority, Priority::Low);

    assert_eq!(stored_keys(&store), vec!["B", "C", "D"]);
    assert!(!store.contains("A").unwrap());
}

#[test]
fn test_frequently_accessed_key_becomes_protected() {
    let tmp = TempDir::new().unwrap();
    let (store, _tx) = open(&tmp, 3, 1_000_000);

    store.put("X", b"X", None).unwrap();
    let mut last = None;
    for _ in 0..3 {
        last = store.get("X").unwrap();
    }
    let x = last.unwrap().entry;
    assert_eq!(x.access_count, 3);
    assert_eq!(x.priority, Priority::High);

    // Churn Low and Medium keys through a full store.
    for i in 0..10 {
        let key = format!("k{i}");
        store.put(&key, key.as_bytes(), None).unwrap();
        if i % 2 == 0 {
            store.get(&key).unwrap();
            store.get(&key).unwrap();
        }
        assert!(store.contains("X").unwrap(), "X evicted at insert {i}");
    }
    assert_eq!(store.usage().total_entries, 3);
    assert_eq!(store.usage().protected_entries, 1);
}

#[test]
fn test_full_of_protected_entries_leaves_store_unchanged() {
    let tmp = TempDir::new().unwrap();
    let (store, _tx) = open(&tmp, 2, 1_000_000);

    store.put("h1", b"one", Some(Priority::High)).unwrap();
    store.put("h2", b"two", Some(Priority::High)).unwrap();
    let before = store.usage();
    let order_before = store.eviction_order().unwrap();

    let err = store.put("low", b"three", None).unwrap_err();
    assert!(matches!(err, StoreError::Full { needed_entries: 1, .. }));

    assert_eq!(store.usage(), before);
    assert_eq!(store.eviction_order().unwrap(), order_before);
    assert!(!store.contains("low").unwrap());
}

#[test]
fn test_high_never_evicted_by_budget_enforcement() {
    let tmp = TempDir::new().unwrap();
    let (store, tx) = open(&tmp, 10, 1_000_000);

    store.put("h", b"h", Some(Priority::High)).unwrap();
    store.put("m", b"m", Some(Priority::Medium)).unwrap();
    store.put("l", b"l", None).unwrap();

    tx.send_modify(|b| b.max_entries = 1);
    assert_eq!(store.enforce_budget().unwrap(), 2);
    assert_eq!(stored_keys(&store), vec!["h"]);

    // Over budget with only protected entries left: nothing more to do.
    tx.send_modify(|b| b.max_bytes = 0);
    assert_eq!(store.enforce_budget().unwrap(), 0);
    assert!(store.contains("h").unwrap());
}

#[test]
fn test_access_count_monotonic_across_replacement() {
    let tmp = TempDir::new().unwrap();
    let (store, _tx) = open(&tmp, 10, 1_000_000);

    store.put("k", b"v1", None).unwrap();
    let mut counts = Vec::new();
    for round in 0..4 {
        counts.push(store.get("k").unwrap().unwrap().entry.access_count);
        if round % 2 == 1 {
            store.put("k", b"replacement", None).unwrap();
        }
        counts.push(store.peek("k").unwrap().unwrap().access_count);
    }

    assert!(counts.windows(2).all(|w| w[0] <= w[1]), "{counts:?}");
    assert_eq!(*counts.last().unwrap(), 4);
}

#[test]
fn test_explicit_priority_only_upgrades() {
    let tmp = TempDir::new().unwrap();
    let (store, _tx) = open(&tmp, 10, 1_000_000);

    store.put("k", b"v", None).unwrap();
    for _ in 0..3 {
        store.get("k").unwrap();
    }
    let entry = store.put("k", b"v2", Some(Priority::Low)).unwrap();
    assert_eq!(entry.priority, Priority::High);
}

#[tokio::test]
async fn test_persist_then_get_preserves_dimensions() {
    let tmp = TempDir::new().unwrap();
    let cache =
        CacheManager::open(&test_config(tmp.path(), fast_budget()), MockSource::new()).unwrap();

    let png = sample_png(96, 64);
    let entry = cache
        .cache_persist("photo", Bytes::from(png.clone()), Priority::Medium)
        .await
        .unwrap();
    let expected = NaturalSize {
        width: 96,
        height: 64,
    };
    assert_eq!(entry.metadata.dimensions, Some(expected));
    assert_eq!(entry.metadata.original_size_bytes, png.len() as u64);

    let found = cache.cache_lookup("photo").await.unwrap().unwrap();
    assert_eq!(found.entry.metadata.dimensions, Some(expected));
    assert!(matches!(
        found.entry.metadata.format,
        StoredFormat::Jpeg | StoredFormat::Passthrough
    ));

    let decoded = image::ImageReader::new(Cursor::new(&found.bytes[..]))
        .with_guessed_format()
        .unwrap()
        .decode()
        .unwrap();
    assert_eq!((decoded.width(), decoded.height()), (96, 64));

    let bytes = cache.cache_get("photo").await.unwrap().unwrap();
    assert_eq!(bytes, found.bytes);
    cache.shutdown();
}

#[tokio::test]
async fn test_cache_persist_surfaces_store_full() {
    let tmp = TempDir::new().unwrap();
    let budget = CacheBudget {
        max_entries: 1,
        ..fast_budget()
    };
    let cache =
        CacheManager::open(&test_config(tmp.path(), budget), MockSource::new()).unwrap();

    cache
        .cache_persist("pinned", Bytes::from_static(b"pinned"), Priority::High)
        .await
        .unwrap();
    let err = cache
        .cache_persist("other", Bytes::from_static(b"other"), Priority::Medium)
        .await
        .unwrap_err();
    assert!(matches!(err, CacheError::Store(StoreError::Full { .. })));
    assert!(cache.cache_get("other").await.unwrap().is_none());
    cache.shutdown();
}

#[tokio::test]
async fn test_clear_resets_store_and_counts() {
    let tmp = TempDir::new().unwrap();
    let cache =
        CacheManager::open(&test_config(tmp.path(), fast_budget()), MockSource::new()).unwrap();

    cache
        .cache_persist("a", Bytes::from_static(b"a"), Priority::High)
        .await
        .unwrap();
    cache.cache_get("a").await.unwrap();
    assert_eq!(cache.stats().store_entries, 1);

    cache.clear().await.unwrap();
    let stats = cache.stats();
    assert_eq!(stats.store_entries, 0);
    assert_eq!(stats.store_bytes, 0);
    let store = Arc::clone(cache.durable().store().unwrap());
    assert_eq!(store.ledger().count("a"), 0);
    cache.shutdown();
}

#[tokio::test]
async fn test_hit_rate_and_compression_ratio() {
    let tmp = TempDir::new().unwrap();
    let cache =
        CacheManager::open(&test_config(tmp.path(), fast_budget()), MockSource::new()).unwrap();

    let text = "the same line over and over\n".repeat(200);
    cache
        .cache_persist("log", Bytes::from(text.clone()), Priority::Low)
        .await
        .unwrap();
    assert_eq!(
        cache.cache_get("log").await.unwrap().unwrap(),
        Bytes::from(text)
    );
    assert!(cache.cache_get("missing").await.unwrap().is_none());

    let stats = cache.stats();
    assert!((stats.hit_rate.unwrap() - 0.5).abs() < f64::EPSILON);
    assert!(stats.compression_ratio > 0.5);
    cache.shutdown();
}
