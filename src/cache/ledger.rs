//! Access ledger: durable map of resource key → access count.
//!
//! Every serve from either tier bumps the count. The ledger is the input to
//! priority classification and only an explicit clear resets it. Counts are
//! mirrored in memory so reads never touch disk; writes go through to LMDB when
//! a backing database is attached, and the ledger keeps working in memory when
//! that write fails.
//!
//! Rows are `storage key → [count u64 BE][original key]`. The original key is
//! only written when the storage key is a digest.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use heed::types::Bytes;
use heed::{Database, Env};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::cache::entry::ResourceKey;
use crate::cache::store::storage_key;

/// The LMDB database holding the counts.
#[derive(Clone)]
pub struct LedgerDb {
    pub env: Env,
    pub db: Database<Bytes, Bytes>,
}

pub struct AccessLedger {
    counts: Mutex<HashMap<ResourceKey, u64>>,
    backing: Option<LedgerDb>,

    /// Set while write-through is failing, so the failure is logged once.
    degraded: AtomicBool,
}

impl AccessLedger {
    /// A ledger that lives only for the process lifetime.
    pub fn in_memory() -> Self {
        Self {
            counts: Mutex::new(HashMap::new()),
            backing: None,
            degraded: AtomicBool::new(false),
        }
    }

    /// Attach to a database and load every persisted count.
    pub fn open(backing: LedgerDb) -> Result<Self, heed::Error> {
        let mut counts = HashMap::new();
        {
            let rtxn = backing.env.read_txn()?;
            for result in backing.db.iter(&rtxn)? {
                let (key, value) = result?;
                let Some((original, count)) = decode_row(key, value) else {
                    warn!("Skipping malformed access ledger record");
                    continue;
                };
                counts.insert(original.to_string(), count);
            }
        }

        debug!(keys = counts.len(), "Access ledger loaded");

        Ok(Self {
            counts: Mutex::new(counts),
            backing: Some(backing),
            degraded: AtomicBool::new(false),
        })
    }

    /// Record one access and return the new count.
    pub fn record(&self, key: &str) -> u64 {
        let mut counts = self.counts.lock();
        let count = counts.entry(key.to_string()).or_insert(0);
        *count += 1;
        let new_count = *count;

        if let Some(backing) = &self.backing {
            match storage_key(key) {
                Ok(skey) => {
                    let mut row = new_count.to_be_bytes().to_vec();
                    if skey != key {
                        row.extend_from_slice(key.as_bytes());
                    }
                    let result = (|| {
                        let mut wtxn = backing.env.write_txn()?;
                        backing.db.put(&mut wtxn, skey.as_bytes(), &row)?;
                        wtxn.commit()
                    })();
                    self.note_write(result);
                }
                Err(e) => debug!(key, error = %e, "Access counted in memory only"),
            }
        }

        new_count
    }

    /// Current count for `key` (zero when never accessed).
    pub fn count(&self, key: &str) -> u64 {
        self.counts.lock().get(key).copied().unwrap_or(0)
    }

    /// Number of keys with a recorded access.
    pub fn len(&self) -> usize {
        self.counts.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.counts.lock().is_empty()
    }

    pub fn is_durable(&self) -> bool {
        self.backing.is_some()
    }

    /// Reset every count.
    pub fn clear(&self) -> Result<(), heed::Error> {
        let mut counts = self.counts.lock();
        if let Some(backing) = &self.backing {
            let mut wtxn = backing.env.write_txn()?;
            backing.db.clear(&mut wtxn)?;
            wtxn.commit()?;
        }
        counts.clear();
        Ok(())
    }

    fn note_write(&self, result: Result<(), heed::Error>) {
        match result {
            Ok(()) => {
                if self.degraded.swap(false, Ordering::Relaxed) {
                    info!("Access ledger write-through recovered");
                }
            }
            Err(e) => {
                if !self.degraded.swap(true, Ordering::Relaxed) {
                    warn!(error = %e, "Access ledger write-through failed; counting in memory only");
                }
            }
        }
    }
}

fn decode_row<'a>(key: &'a [u8], value: &'a [u8]) -> Option<(&'a str, u64)> {
    if value.len() < 8 {
        return None;
    }
    let count = u64::from_be_bytes(value[..8].try_into().ok()?);
    let original = if value.len() > 8 {
        std::str::from_utf8(&value[8..]).ok()?
    } else {
        std::str::from_utf8(key).ok()?
    };
    Some((original, count))
}

#[cfg(test)]
mod tests {
    use super::*;
    use heed::EnvOpenOptions;
    use tempfile::TempDir;

    fn open_db(dir: &std::path::Path) -> LedgerDb {
        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(10 * 1024 * 1024)
                .max_dbs(1)
                .open(dir)
                .unwrap()
        };
        let mut wtxn = env.write_txn().unwrap();
        let db = env
            .create_database::<Bytes, Bytes>(&mut wtxn, Some("access_ledger"))
            .unwrap();
        wtxn.commit().unwrap();
        LedgerDb { env, db }
    }

    #[test]
    fn test_in_memory_counts() {
        let ledger = AccessLedger::in_memory();
        assert_eq!(ledger.count("a"), 0);
        assert_eq!(ledger.record("a"), 1);
        assert_eq!(ledger.record("a"), 2);
        assert_eq!(ledger.record("b"), 1);
        assert_eq!(ledger.len(), 2);
        assert!(!ledger.is_durable());
    }

    #[test]
    fn test_counts_survive_reopen() {
        let tmp = TempDir::new().unwrap();
        let backing = open_db(tmp.path());
        {
            let ledger = AccessLedger::open(backing.clone()).unwrap();
            ledger.record("x");
            ledger.record("x");
            ledger.record("y");
        }

        let ledger = AccessLedger::open(backing).unwrap();
        assert_eq!(ledger.count("x"), 2);
        assert_eq!(ledger.count("y"), 1);
    }

    #[test]
    fn test_clear_resets_durable_counts() {
        let tmp = TempDir::new().unwrap();
        let backing = open_db(tmp.path());
        let ledger = AccessLedger::open(backing.clone()).unwrap();
        ledger.record("x");
        ledger.clear().unwrap();
        assert_eq!(ledger.count("x"), 0);

        let reopened = AccessLedger::open(backing).unwrap();
        assert!(reopened.is_empty());
    }

    #[test]
    fn test_long_and_empty_keys() {
        let tmp = TempDir::new().unwrap();
        let backing = open_db(tmp.path());
        let long = format!("https://cdn.example.com/{}", "a".repeat(600));
        {
            let ledger = AccessLedger::open(backing.clone()).unwrap();
            ledger.record(&long);
            ledger.record(&long);
            assert_eq!(ledger.record(""), 1);
            assert!(!ledger.degraded.load(Ordering::Relaxed));
        }

        let ledger = AccessLedger::open(backing).unwrap();
        assert_eq!(ledger.count(&long), 2);
        assert_eq!(ledger.count(""), 0);
    }
}
