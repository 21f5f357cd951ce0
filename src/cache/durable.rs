//! Async face of the persistent tier, with degraded-mode tracking.
//!
//! LMDB calls are blocking, so every operation runs on the blocking pool. When
//! the store fails with an I/O error the tier is marked unhealthy: the failure
//! is logged once, later operations short-circuit (memory-tier-only mode), and
//! [`DurableTier::probe`] brings it back. Rejections of a single operation
//! (an invalid key, a full map, a full budget) leave the health untouched.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use tokio::sync::Notify;
use tracing::{debug, info, warn};

use crate::cache::entry::{PersistentEntry, Priority};
use crate::cache::store::{PersistentStore, StoreError, StoreUsage, StoredPayload};

pub struct DurableTier {
    store: Option<Arc<PersistentStore>>,
    healthy: AtomicBool,

    /// Fire-and-forget writes not yet finished.
    pending_offers: AtomicUsize,
    idle: Notify,
}

impl DurableTier {
    pub fn new(store: Arc<PersistentStore>) -> Self {
        Self::with_store(Some(store))
    }

    /// A tier with no backing store; every read misses and every write is rejected.
    pub fn memory_only() -> Self {
        Self::with_store(None)
    }

    fn with_store(store: Option<Arc<PersistentStore>>) -> Self {
        Self {
            store,
            healthy: AtomicBool::new(true),
            pending_offers: AtomicUsize::new(0),
            idle: Notify::new(),
        }
    }

    pub fn store(&self) -> Option<&Arc<PersistentStore>> {
        self.store.as_ref()
    }

    /// Whether reads and writes currently reach the store.
    pub fn is_available(&self) -> bool {
        self.store.is_some() && self.healthy.load(Ordering::Relaxed)
    }

    /// Read a payload; errors are logged and reported as a miss.
    pub async fn get(&self, key: &str) -> Option<StoredPayload> {
        match self.try_get(key).await {
            Ok(found) => found,
            Err(StoreError::Unavailable) => None,
            Err(e) => {
                warn!(key, error = %e, "Persistent read failed");
                None
            }
        }
    }

    pub async fn try_get(&self, key: &str) -> Result<Option<StoredPayload>, StoreError> {
        let owned = key.to_string();
        self.run(move |store| store.get(&owned)).await
    }

    pub async fn put(
        &self,
        key: &str,
        payload: Bytes,
        explicit: Option<Priority>,
    ) -> Result<PersistentEntry, StoreError> {
        let owned = key.to_string();
        self.run(move |store| store.put(&owned, &payload, explicit))
            .await
    }

    /// Persist in the background. The outcome is logged, never returned.
    pub fn offer(self: &Arc<Self>, key: &str, payload: Bytes, explicit: Option<Priority>) {
        if !self.is_available() {
            return;
        }

        self.pending_offers.fetch_add(1, Ordering::AcqRel);
        let tier = Arc::clone(self);
        let key = key.to_string();
        tokio::spawn(async move {
            match tier.put(&key, payload, explicit).await {
                Ok(entry) => debug!(
                    key,
                    size = entry.size_bytes,
                    priority = %entry.priority,
                    "Offered payload persisted"
                ),
                Err(StoreError::Full { .. }) => {
                    debug!(key, "Offered payload not persisted: store full of protected entries")
                }
                Err(e) => debug!(key, error = %e, "Offered payload not persisted"),
            }
            if tier.pending_offers.fetch_sub(1, Ordering::AcqRel) == 1 {
                tier.idle.notify_waiters();
            }
        });
    }

    /// Wait for every background write to finish.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.idle.notified();
            if self.pending_offers.load(Ordering::Acquire) == 0 {
                return;
            }
            notified.await;
        }
    }

    pub async fn clear(&self) -> Result<(), StoreError> {
        self.run(|store| store.clear()).await
    }

    pub async fn enforce_budget(&self) -> Result<usize, StoreError> {
        self.run(|store| store.enforce_budget()).await
    }

    /// Try the store once, even while degraded. Returns the resulting health.
    pub async fn probe(&self) -> bool {
        let Some(store) = self.store.clone() else {
            return false;
        };
        let result = tokio::task::spawn_blocking(move || store.probe())
            .await
            .unwrap_or_else(|e| Err(StoreError::Io(std::io::Error::other(e))));
        self.note(&result);
        result.is_ok()
    }

    /// Occupancy counters; `None` without a backing store.
    pub fn usage(&self) -> Option<StoreUsage> {
        self.store.as_ref().map(|store| store.usage())
    }

    async fn run<T, F>(&self, op: F) -> Result<T, StoreError>
    where
        T: Send + 'static,
        F: FnOnce(&PersistentStore) -> Result<T, StoreError> + Send + 'static,
    {
        if !self.is_available() {
            return Err(StoreError::Unavailable);
        }
        let Some(store) = self.store.clone() else {
            return Err(StoreError::Unavailable);
        };

        let result = tokio::task::spawn_blocking(move || op(&store))
            .await
            .unwrap_or_else(|e| Err(StoreError::Io(std::io::Error::other(e))));
        self.note(&result);
        result
    }

    /// Fold an operation's outcome into the health flag.
    pub(crate) fn note<T>(&self, result: &Result<T, StoreError>) {
        match result {
            Err(e) if e.is_persistence_failure() && !matches!(e, StoreError::Unavailable) => {
                if self.healthy.swap(false, Ordering::Relaxed) {
                    warn!(error = %e, "Persistent tier unavailable; continuing memory-only");
                }
            }
            Err(_) => {}
            Ok(_) => {
                if !self.healthy.swap(true, Ordering::Relaxed) {
                    info!("Persistent tier recovered");
                }
            }
        }
    }
}
