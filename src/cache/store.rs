//! Persistent tier: a size- and count-bounded store of compressed payloads.
//!
//! Backed by an LMDB environment with four named databases:
//!
//! ```text
//! entries         key → JSON EntryRecord (metadata, access state)
//! payloads        key → stored bytes
//! eviction_index  [rank u8][access_seq u64 BE][key] → [size u64 BE][original u64 BE]
//! access_ledger   key → count u64 BE
//! ```
//!
//! LMDB keeps keys sorted, so the eviction order `(priority, last access)` is
//! a forward scan of `eviction_index`. Totals are kept in memory behind one
//! lock and rebuilt from the index on open.
//!
//! LMDB caps keys at 511 bytes, so resource keys longer than
//! [`MAX_INLINE_KEY`] are stored under `sha256:<hex digest>`.

use std::borrow::Cow;
use std::path::Path;
use std::sync::Arc;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use heed::types::Bytes as RawBytes;
use heed::{Database, Env, EnvOpenOptions, MdbError, RoTxn, RwTxn};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::cache::compressor::{CompressionError, Compressor};
use crate::cache::entry::{effective_priority, EntryMetadata, PersistentEntry, Priority};
use crate::cache::evictor::{EvictionCandidate, Evictor, Shortfall};
use crate::cache::ledger::{AccessLedger, LedgerDb};
use crate::config::{CacheBudget, CompressionConfig, StoreConfig};

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Store full: {needed_bytes} bytes / {needed_entries} entries cannot be freed without evicting high-priority entries")]
    Full {
        needed_bytes: u64,
        needed_entries: usize,
    },

    #[error("Persistence I/O error: {0}")]
    PersistenceIo(#[source] heed::Error),

    #[error("LMDB map is full; raise store.map_size_mb")]
    MapFull,

    #[error("Key rejected: {0}")]
    InvalidKey(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Corrupt record for {key}: {source}")]
    Corrupt {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Stored payload could not be decoded: {0}")]
    Decode(#[from] CompressionError),

    #[error("Persistent tier is unavailable")]
    Unavailable,
}

impl From<heed::Error> for StoreError {
    fn from(e: heed::Error) -> Self {
        match e {
            heed::Error::Mdb(MdbError::MapFull) => StoreError::MapFull,
            heed::Error::Mdb(MdbError::BadValSize) => {
                StoreError::InvalidKey("size out of range for LMDB".to_string())
            }
            other => StoreError::PersistenceIo(other),
        }
    }
}

impl StoreError {
    /// Whether the durable store itself is failing (as opposed to a rejection of one operation).
    pub fn is_persistence_failure(&self) -> bool {
        matches!(
            self,
            StoreError::PersistenceIo(_) | StoreError::Io(_) | StoreError::Unavailable
        )
    }
}

/// Longest resource key stored verbatim. Index rows add a 9-byte prefix.
pub const MAX_INLINE_KEY: usize = 400;

const DIGEST_PREFIX: &str = "sha256:";

/// The LMDB key a resource key is stored under.
///
/// Keys that are too long, or that could be mistaken for a digest, are
/// replaced by their SHA-256. Empty keys are rejected.
pub fn storage_key(key: &str) -> Result<Cow<'_, str>, StoreError> {
    if key.is_empty() {
        return Err(StoreError::InvalidKey("empty key".to_string()));
    }
    if key.len() <= MAX_INLINE_KEY && !key.starts_with(DIGEST_PREFIX) {
        return Ok(Cow::Borrowed(key));
    }
    let mut hasher = Sha256::new();
    hasher.update(key.as_bytes());
    Ok(Cow::Owned(format!(
        "{DIGEST_PREFIX}{}",
        hex::encode(hasher.finalize())
    )))
}

/// What the `entries` database holds per key.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct EntryRecord {
    size_bytes: u64,
    last_accessed_at: DateTime<Utc>,
    access_seq: u64,
    access_count: u64,
    priority: Priority,
    metadata: EntryMetadata,
}

impl EntryRecord {
    fn into_entry(self, key: &str, payload: Bytes) -> PersistentEntry {
        PersistentEntry {
            key: key.to_string(),
            payload,
            size_bytes: self.size_bytes,
            last_accessed_at: self.last_accessed_at,
            access_count: self.access_count,
            priority: self.priority,
            metadata: self.metadata,
            access_seq: self.access_seq,
        }
    }
}

/// A payload read back from the store, with the stored encoding undone.
#[derive(Debug, Clone)]
pub struct StoredPayload {
    pub bytes: Bytes,
    pub entry: PersistentEntry,
}

/// Occupancy and traffic counters.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct StoreUsage {
    pub total_bytes: u64,
    pub total_entries: usize,

    /// Sum of the input sizes of every stored payload.
    pub original_bytes: u64,

    /// Entries that automatic eviction will not touch.
    pub protected_entries: usize,

    pub gets: u64,
    pub hits: u64,
}

impl StoreUsage {
    pub fn hit_rate(&self) -> f64 {
        if self.gets == 0 {
            return 0.0;
        }
        self.hits as f64 / self.gets as f64
    }

    /// `1 - stored/original`; zero for an empty store.
    pub fn compression_ratio(&self) -> f64 {
        if self.original_bytes == 0 {
            return 0.0;
        }
        1.0 - self.total_bytes as f64 / self.original_bytes as f64
    }
}

#[derive(Debug, Default)]
struct StoreState {
    usage: StoreUsage,
    next_seq: u64,
}

pub struct PersistentStore {
    env: Env,
    entries: Database<RawBytes, RawBytes>,
    payloads: Database<RawBytes, RawBytes>,
    index: Database<RawBytes, RawBytes>,

    ledger: Arc<AccessLedger>,
    compressor: Compressor,
    budget: watch::Receiver<CacheBudget>,

    state: Mutex<StoreState>,
}

impl PersistentStore {
    /// Open (or create) the store at `config.path`.
    pub fn open(
        config: &StoreConfig,
        compression: CompressionConfig,
        budget: watch::Receiver<CacheBudget>,
    ) -> Result<Self, StoreError> {
        Self::open_at(&config.path, config.map_size_mb, compression, budget)
    }

    pub fn open_at(
        path: &Path,
        map_size_mb: usize,
        compression: CompressionConfig,
        budget: watch::Receiver<CacheBudget>,
    ) -> Result<Self, StoreError> {
        std::fs::create_dir_all(path)?;

        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(map_size_mb * 1024 * 1024)
                .max_dbs(4)
                .open(path)?
        };

        let mut wtxn = env.write_txn()?;
        let entries = env.create_database::<RawBytes, RawBytes>(&mut wtxn, Some("entries"))?;
        let payloads = env.create_database::<RawBytes, RawBytes>(&mut wtxn, Some("payloads"))?;
        let index = env.create_database::<RawBytes, RawBytes>(&mut wtxn, Some("eviction_index"))?;
        let ledger_db =
            env.create_database::<RawBytes, RawBytes>(&mut wtxn, Some("access_ledger"))?;
        wtxn.commit()?;

        let ledger = AccessLedger::open(LedgerDb {
            env: env.clone(),
            db: ledger_db,
        })?;

        let state = {
            let rtxn = env.read_txn()?;
            let mut state = StoreState::default();
            for result in index.iter(&rtxn)? {
                let (key, value) = result?;
                let Some(candidate) = decode_index(key, value) else {
                    warn!("Skipping malformed eviction index record");
                    continue;
                };
                state.usage.total_bytes += candidate.size_bytes;
                state.usage.original_bytes += candidate.original_size_bytes;
                state.usage.total_entries += 1;
                if candidate.priority.is_protected() {
                    state.usage.protected_entries += 1;
                }
                state.next_seq = state.next_seq.max(candidate.access_seq + 1);
            }
            state
        };

        info!(
            path = %path.display(),
            entries = state.usage.total_entries,
            bytes = state.usage.total_bytes,
            protected = state.usage.protected_entries,
            "Persistent store opened"
        );

        Ok(Self {
            env,
            entries,
            payloads,
            index,
            ledger: Arc::new(ledger),
            compressor: Compressor::new(compression),
            budget,
            state: Mutex::new(state),
        })
    }

    /// The ledger sharing this store's environment.
    pub fn ledger(&self) -> &Arc<AccessLedger> {
        &self.ledger
    }

    /// Compress and insert `raw` under `key`, evicting as needed.
    ///
    /// The priority is classified from the ledger's access count; `explicit`
    /// can only raise it. Replacing an existing key never lowers its priority
    /// or access count. Fails with [`StoreError::Full`] (and leaves the store
    /// untouched) when only `High` entries stand in the way.
    pub fn put(
        &self,
        key: &str,
        raw: &[u8],
        explicit: Option<Priority>,
    ) -> Result<PersistentEntry, StoreError> {
        let skey = storage_key(key)?;
        let budget = self.budget.borrow().clone();
        let evictor = Evictor::new(budget.priority_threshold);

        let compressed = match self.compressor.compress(raw, budget.compression_quality) {
            Ok(compressed) => compressed,
            Err(e) => {
                warn!(key, error = %e, "Compression failed, storing payload uncompressed");
                self.compressor.passthrough(raw)
            }
        };
        let new_size = compressed.bytes.len() as u64;
        if new_size > budget.max_bytes {
            return Err(StoreError::Full {
                needed_bytes: new_size - budget.max_bytes,
                needed_entries: 0,
            });
        }

        let ledger_count = self.ledger.count(key);

        let mut state = self.state.lock();
        let mut wtxn = self.env.write_txn()?;

        let existing = self.read_record(&wtxn, &skey)?;
        let (released_bytes, released_entries) = existing
            .as_ref()
            .map(|r| (r.size_bytes, 1))
            .unwrap_or((0, 0));

        let bytes_after = state.usage.total_bytes - released_bytes + new_size;
        let entries_after = state.usage.total_entries - released_entries + 1;
        let needed = Shortfall {
            bytes: bytes_after.saturating_sub(budget.max_bytes),
            entries: entries_after.saturating_sub(budget.max_entries),
        };

        let victims = if needed.is_empty() {
            Vec::new()
        } else {
            let selection = evictor.select_victims(self.candidates(&wtxn)?, needed, Some(skey.as_ref()));
            if !selection.is_satisfied() {
                warn!(
                    key,
                    needed_bytes = needed.bytes,
                    needed_entries = needed.entries,
                    protected = state.usage.protected_entries,
                    "Insert rejected: store is full of protected entries"
                );
                return Err(StoreError::Full {
                    needed_bytes: needed.bytes,
                    needed_entries: needed.entries,
                });
            }
            selection.victims
        };

        for victim in &victims {
            self.delete_entry(&mut wtxn, victim)?;
        }

        let access_count = existing
            .as_ref()
            .map(|r| r.access_count.max(ledger_count))
            .unwrap_or(ledger_count);
        let mut priority = effective_priority(evictor.classify(access_count), explicit);
        if let Some(old) = &existing {
            priority = priority.max(old.priority);
            self.index
                .delete(&mut wtxn, &index_key(old.priority, old.access_seq, &skey))?;
        }

        let record = EntryRecord {
            size_bytes: new_size,
            last_accessed_at: Utc::now(),
            access_seq: state.next_seq,
            access_count,
            priority,
            metadata: compressed.metadata,
        };
        self.write_entry(&mut wtxn, &skey, &record, Some(&compressed.bytes))?;
        wtxn.commit()?;

        state.next_seq += 1;
        let usage = &mut state.usage;
        for victim in &victims {
            usage.total_bytes -= victim.size_bytes;
            usage.original_bytes -= victim.original_size_bytes;
            usage.total_entries -= 1;
        }
        if let Some(old) = &existing {
            usage.total_bytes -= old.size_bytes;
            usage.original_bytes -= old.metadata.original_size_bytes;
            usage.total_entries -= 1;
            if old.priority.is_protected() {
                usage.protected_entries -= 1;
            }
        }
        usage.total_bytes += record.size_bytes;
        usage.original_bytes += record.metadata.original_size_bytes;
        usage.total_entries += 1;
        if record.priority.is_protected() {
            usage.protected_entries += 1;
        }

        for victim in &victims {
            debug!(key = %victim.key, priority = %victim.priority, bytes = victim.size_bytes, "Evicted entry");
        }
        if !victims.is_empty() {
            info!(
                evicted = victims.len(),
                entries = usage.total_entries,
                bytes = usage.total_bytes,
                "Eviction round complete"
            );
        }
        debug!(
            key,
            size = record.size_bytes,
            original = record.metadata.original_size_bytes,
            format = ?record.metadata.format,
            priority = %record.priority,
            "Persisted entry"
        );

        Ok(record.into_entry(key, Bytes::from(compressed.bytes)))
    }

    /// Read a payload, refreshing its access state.
    ///
    /// Increments the access count, stamps a new access time, reclassifies
    /// (promotion only) and records the access in the ledger.
    pub fn get(&self, key: &str) -> Result<Option<StoredPayload>, StoreError> {
        let skey = storage_key(key)?;
        let threshold = self.budget.borrow().priority_threshold;
        let evictor = Evictor::new(threshold);
        let ledger_count = self.ledger.count(key);

        let (record, stored) = {
            let mut state = self.state.lock();
            state.usage.gets += 1;

            let mut wtxn = self.env.write_txn()?;
            let Some(mut record) = self.read_record(&wtxn, &skey)? else {
                return Ok(None);
            };
            let Some(stored) = self.payloads.get(&wtxn, skey.as_bytes())?.map(|b| b.to_vec())
            else {
                warn!(key, "Entry has no payload; treating as a miss");
                return Ok(None);
            };

            let old_priority = record.priority;
            self.index
                .delete(&mut wtxn, &index_key(record.priority, record.access_seq, &skey))?;

            record.access_count = (record.access_count + 1).max(ledger_count + 1);
            record.priority = record.priority.max(evictor.classify(record.access_count));
            record.last_accessed_at = Utc::now();
            record.access_seq = state.next_seq;

            self.write_entry(&mut wtxn, &skey, &record, None)?;
            wtxn.commit()?;

            state.next_seq += 1;
            state.usage.hits += 1;
            if record.priority.is_protected() && !old_priority.is_protected() {
                state.usage.protected_entries += 1;
                debug!(key, access_count = record.access_count, "Entry promoted to high priority");
            }
            (record, stored)
        };

        self.ledger.record(key);

        let bytes = Bytes::from(self.compressor.decode_stored(&stored, record.metadata.format)?);
        Ok(Some(StoredPayload {
            bytes,
            entry: record.into_entry(key, Bytes::from(stored)),
        }))
    }

    /// Entry metadata and stored bytes, without touching access state.
    pub fn peek(&self, key: &str) -> Result<Option<PersistentEntry>, StoreError> {
        let skey = storage_key(key)?;
        let rtxn = self.env.read_txn()?;
        let Some(record) = self.read_record(&rtxn, &skey)? else {
            return Ok(None);
        };
        let stored = self
            .payloads
            .get(&rtxn, skey.as_bytes())?
            .map(Bytes::copy_from_slice)
            .unwrap_or_default();
        Ok(Some(record.into_entry(key, stored)))
    }

    pub fn contains(&self, key: &str) -> Result<bool, StoreError> {
        let skey = storage_key(key)?;
        let rtxn = self.env.read_txn()?;
        Ok(self.entries.get(&rtxn, skey.as_bytes())?.is_some())
    }

    /// Open a read transaction and count entries; independent of any key.
    pub fn probe(&self) -> Result<u64, StoreError> {
        let rtxn = self.env.read_txn()?;
        Ok(self.entries.len(&rtxn)?)
    }

    /// Storage keys in eviction order (first = next to go).
    pub fn eviction_order(&self) -> Result<Vec<(String, Priority)>, StoreError> {
        let rtxn = self.env.read_txn()?;
        Ok(self
            .candidates(&rtxn)?
            .into_iter()
            .map(|c| (c.key, c.priority))
            .collect())
    }

    /// Remove every entry and reset the access ledger.
    pub fn clear(&self) -> Result<(), StoreError> {
        {
            let mut state = self.state.lock();
            let mut wtxn = self.env.write_txn()?;
            self.entries.clear(&mut wtxn)?;
            self.payloads.clear(&mut wtxn)?;
            self.index.clear(&mut wtxn)?;
            wtxn.commit()?;

            let removed = state.usage.total_entries;
            state.usage = StoreUsage {
                gets: state.usage.gets,
                hits: state.usage.hits,
                ..Default::default()
            };
            info!(removed, "Persistent store cleared");
        }
        self.ledger.clear()?;
        Ok(())
    }

    /// Evict non-`High` entries until the current budget holds.
    ///
    /// Returns the number of entries removed. When protected entries alone
    /// exceed the budget the store stays over it.
    pub fn enforce_budget(&self) -> Result<usize, StoreError> {
        let budget = self.budget.borrow().clone();
        let evictor = Evictor::new(budget.priority_threshold);

        let mut state = self.state.lock();
        let needed = Shortfall {
            bytes: state.usage.total_bytes.saturating_sub(budget.max_bytes),
            entries: state.usage.total_entries.saturating_sub(budget.max_entries),
        };
        if needed.is_empty() {
            return Ok(0);
        }

        let mut wtxn = self.env.write_txn()?;
        let selection = evictor.select_victims(self.candidates(&wtxn)?, needed, None);
        for victim in &selection.victims {
            self.delete_entry(&mut wtxn, victim)?;
        }
        wtxn.commit()?;

        for victim in &selection.victims {
            state.usage.total_bytes -= victim.size_bytes;
            state.usage.original_bytes -= victim.original_size_bytes;
            state.usage.total_entries -= 1;
        }
        if !selection.is_satisfied() {
            warn!(
                over_bytes = selection.remaining.bytes,
                over_entries = selection.remaining.entries,
                "Budget still exceeded; remaining entries are protected"
            );
        }
        info!(evicted = selection.victims.len(), "Budget enforcement complete");
        Ok(selection.victims.len())
    }

    pub fn usage(&self) -> StoreUsage {
        self.state.lock().usage
    }

    fn read_record(&self, txn: &RoTxn, key: &str) -> Result<Option<EntryRecord>, StoreError> {
        match self.entries.get(txn, key.as_bytes())? {
            Some(bytes) => serde_json::from_slice(bytes)
                .map(Some)
                .map_err(|source| StoreError::Corrupt {
                    key: key.to_string(),
                    source,
                }),
            None => Ok(None),
        }
    }

    /// Write the record and its index row; the payload only when given.
    fn write_entry(
        &self,
        wtxn: &mut RwTxn,
        key: &str,
        record: &EntryRecord,
        payload: Option<&[u8]>,
    ) -> Result<(), StoreError> {
        let encoded = serde_json::to_vec(record).map_err(|source| StoreError::Corrupt {
            key: key.to_string(),
            source,
        })?;
        self.entries.put(wtxn, key.as_bytes(), &encoded)?;
        if let Some(payload) = payload {
            self.payloads.put(wtxn, key.as_bytes(), payload)?;
        }
        self.index.put(
            wtxn,
            &index_key(record.priority, record.access_seq, key),
            &index_value(record.size_bytes, record.metadata.original_size_bytes),
        )?;
        Ok(())
    }

    fn delete_entry(&self, wtxn: &mut RwTxn, victim: &EvictionCandidate) -> Result<(), StoreError> {
        self.entries.delete(wtxn, victim.key.as_bytes())?;
        self.payloads.delete(wtxn, victim.key.as_bytes())?;
        self.index.delete(
            wtxn,
            &index_key(victim.priority, victim.access_seq, &victim.key),
        )?;
        Ok(())
    }

    /// Every index row in eviction order.
    fn candidates(&self, txn: &RoTxn) -> Result<Vec<EvictionCandidate>, StoreError> {
        let mut candidates = Vec::new();
        for result in self.index.iter(txn)? {
            let (key, value) = result?;
            if let Some(candidate) = decode_index(key, value) {
                candidates.push(candidate);
            }
        }
        Ok(candidates)
    }
}

fn index_key(priority: Priority, access_seq: u64, key: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(9 + key.len());
    out.push(priority.rank());
    out.extend_from_slice(&access_seq.to_be_bytes());
    out.extend_from_slice(key.as_bytes());
    out
}

fn index_value(size_bytes: u64, original_size_bytes: u64) -> [u8; 16] {
    let mut out = [0u8; 16];
    out[..8].copy_from_slice(&size_bytes.to_be_bytes());
    out[8..].copy_from_slice(&original_size_bytes.to_be_bytes());
    out
}

fn decode_index(key: &[u8], value: &[u8]) -> Option<EvictionCandidate> {
    if key.len() < 9 || value.len() != 16 {
        return None;
    }
    let priority = Priority::from_rank(key[0])?;
    let access_seq = u64::from_be_bytes(key[1..9].try_into().ok()?);
    let name = std::str::from_utf8(&key[9..]).ok()?;
    Some(EvictionCandidate {
        key: name.to_string(),
        priority,
        access_seq,
        size_bytes: u64::from_be_bytes(value[..8].try_into().ok()?),
        original_size_bytes: u64::from_be_bytes(value[8..].try_into().ok()?),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open(dir: &Path, budget: CacheBudget) -> (PersistentStore, watch::Sender<CacheBudget>) {
        let (tx, rx) = watch::channel(budget);
        let store = PersistentStore::open_at(dir, 64, CompressionConfig::default(), rx).unwrap();
        (store, tx)
    }

    fn budget(max_entries: usize, max_bytes: u64) -> CacheBudget {
        CacheBudget {
            max_entries,
            max_bytes,
            ..Default::default()
        }
    }

    #[test]
    fn test_index_key_roundtrip_and_order() {
        let low_new = index_key(Priority::Low, 9, "b");
        let low_old = index_key(Priority::Low, 2, "z");
        let medium = index_key(Priority::Medium, 0, "a");
        assert!(low_old < low_new);
        assert!(low_new < medium);

        let decoded = decode_index(&low_old, &index_value(10, 20)).unwrap();
        assert_eq!(decoded.key, "z");
        assert_eq!(decoded.access_seq, 2);
        assert_eq!(decoded.size_bytes, 10);
        assert_eq!(decoded.original_size_bytes, 20);
    }

    #[test]
    fn test_put_get_updates_access() {
        let tmp = TempDir::new().unwrap();
        let (store, _tx) = open(tmp.path(), budget(10, 1_000_000));

        let entry = store.put("a", b"opaque-bytes-opaque-bytes", None).unwrap();
        assert_eq!(entry.priority, Priority::Low);
        assert_eq!(entry.access_count, 0);

        let first = store.get("a").unwrap().unwrap();
        assert_eq!(&first.bytes[..], b"opaque-bytes-opaque-bytes");
        assert_eq!(first.entry.access_count, 1);

        let second = store.get("a").unwrap().unwrap();
        assert_eq!(second.entry.access_count, 2);
        assert_eq!(second.entry.priority, Priority::Medium);
        assert!(second.entry.last_accessed_at >= first.entry.last_accessed_at);
        assert_eq!(store.ledger().count("a"), 2);

        let usage = store.usage();
        assert_eq!(usage.gets, 2);
        assert_eq!(usage.hits, 2);
    }

    #[test]
    fn test_miss_counts_as_get() {
        let tmp = TempDir::new().unwrap();
        let (store, _tx) = open(tmp.path(), budget(10, 1_000_000));
        assert!(store.get("missing").unwrap().is_none());
        let usage = store.usage();
        assert_eq!(usage.gets, 1);
        assert_eq!(usage.hits, 0);
        assert_eq!(usage.hit_rate(), 0.0);
    }

    #[test]
    fn test_replacement_keeps_priority() {
        let tmp = TempDir::new().unwrap();
        let (store, _tx) = open(tmp.path(), budget(10, 1_000_000));

        store.put("a", b"first", Some(Priority::High)).unwrap();
        let replaced = store.put("a", b"second", None).unwrap();
        assert_eq!(replaced.priority, Priority::High);

        let usage = store.usage();
        assert_eq!(usage.total_entries, 1);
        assert_eq!(usage.protected_entries, 1);
        assert_eq!(usage.total_bytes, b"second".len() as u64);
    }

    #[test]
    fn test_oversized_payload_rejected() {
        let tmp = TempDir::new().unwrap();
        let (store, _tx) = open(tmp.path(), budget(10, 8));
        let err = store.put("big", b"0123456789abcdef", None).unwrap_err();
        assert!(matches!(err, StoreError::Full { .. }));
        assert_eq!(store.usage().total_entries, 0);
    }

    #[test]
    fn test_enforce_budget_after_shrink() {
        let tmp = TempDir::new().unwrap();
        let (store, tx) = open(tmp.path(), budget(5, 1_000_000));
        for key in ["a", "b", "c", "d"] {
            store.put(key, key.as_bytes(), None).unwrap();
        }
        store.put("h", b"h", Some(Priority::High)).unwrap();

        tx.send_modify(|b| b.max_entries = 2);
        let evicted = store.enforce_budget().unwrap();
        assert_eq!(evicted, 3);

        let order = store.eviction_order().unwrap();
        let keys: Vec<_> = order.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["d", "h"]);
    }

    #[test]
    fn test_state_rebuilt_on_reopen() {
        let tmp = TempDir::new().unwrap();
        {
            let (store, _tx) = open(tmp.path(), budget(10, 1_000_000));
            store.put("a", b"aaaa", None).unwrap();
            store.put("b", b"bb", Some(Priority::High)).unwrap();
            store.get("a").unwrap();
        }

        let (store, _tx) = open(tmp.path(), budget(10, 1_000_000));
        let usage = store.usage();
        assert_eq!(usage.total_entries, 2);
        assert_eq!(usage.total_bytes, 6);
        assert_eq!(usage.protected_entries, 1);
        assert_eq!(store.ledger().count("a"), 1);

        // The reopened clock continues past the stored sequence numbers.
        store.put("c", b"c", None).unwrap();
        let order = store.eviction_order().unwrap();
        let keys: Vec<_> = order.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(keys, vec!["a", "c", "b"]);
    }

    #[test]
    fn test_clear_removes_protected_and_ledger() {
        let tmp = TempDir::new().unwrap();
        let (store, _tx) = open(tmp.path(), budget(10, 1_000_000));
        store.put("h", b"h", Some(Priority::High)).unwrap();
        store.get("h").unwrap();

        store.clear().unwrap();
        assert!(!store.contains("h").unwrap());
        assert_eq!(store.usage().total_entries, 0);
        assert_eq!(store.ledger().count("h"), 0);
    }

    #[test]
    fn test_long_keys_stored_under_digest() {
        let tmp = TempDir::new().unwrap();
        let (store, _tx) = open(tmp.path(), budget(10, 1_000_000));
        let long = format!("https://cdn.example.com/{}", "a".repeat(600));
        let other = format!("https://cdn.example.com/{}", "b".repeat(600));

        let entry = store.put(&long, b"long payload", None).unwrap();
        assert_eq!(entry.key, long);
        store.put(&other, b"other payload", None).unwrap();

        let found = store.get(&long).unwrap().unwrap();
        assert_eq!(&found.bytes[..], b"long payload");
        assert_eq!(found.entry.key, long);
        assert!(store.contains(&other).unwrap());
        assert_eq!(store.ledger().count(&long), 1);
        assert_eq!(store.usage().total_entries, 2);

        let order = store.eviction_order().unwrap();
        assert!(order.iter().all(|(k, _)| k.starts_with("sha256:")));
    }

    #[test]
    fn test_digest_lookalike_key_is_hashed() {
        let digest = storage_key(&"x".repeat(MAX_INLINE_KEY + 1))
            .unwrap()
            .into_owned();
        assert!(digest.starts_with("sha256:"));
        assert_ne!(storage_key(&digest).unwrap(), digest.as_str());
        assert_eq!(storage_key("plain").unwrap(), "plain");
        assert!(matches!(storage_key(""), Err(StoreError::InvalidKey(_))));
    }

    #[test]
    fn test_per_key_errors_are_not_persistence_failures() {
        let tmp = TempDir::new().unwrap();
        let (store, _tx) = open(tmp.path(), budget(10, 1_000_000));
        let err = store.put("", b"x", None).unwrap_err();
        assert!(!err.is_persistence_failure());
        assert!(store.get("").is_err());

        assert!(matches!(
            StoreError::from(heed::Error::Mdb(MdbError::MapFull)),
            StoreError::MapFull
        ));
        assert!(!StoreError::MapFull.is_persistence_failure());
        assert!(StoreError::Io(std::io::Error::other("eio")).is_persistence_failure());
        assert_eq!(store.probe().unwrap(), 0);
    }
}
