//! The cache facade.
//!
//! [`CacheManager`] wires the tiers together: one budget channel, one
//! connectivity channel, the persistent store (or memory-only mode when it
//! cannot be opened), the fetch executor, the window and the sync manager.

use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;
use tokio::sync::{broadcast, oneshot, watch};
use tokio_stream::wrappers::BroadcastStream;
use tracing::{info, warn};

use crate::cache::durable::DurableTier;
use crate::cache::entry::{FetchPriority, PersistentEntry, Priority, ResourceKey, WindowEntry};
use crate::cache::ledger::AccessLedger;
use crate::cache::store::{PersistentStore, StoreError, StoredPayload};
use crate::cache::window::{WindowCache, WindowEvent};
use crate::config::{CacheBudget, Config};
use crate::stats::aggregator::{summarize, StatsSnapshot, WindowStats};
use crate::sync::manager::{ReconcileReport, Reconciler, SyncManager, SyncStatus};
use crate::transfer::fetcher::{FetchExecutor, FetchResult};
use crate::transfer::source::ResourceSource;

#[derive(Error, Debug)]
pub enum CacheError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Persistent tier unavailable")]
    PersistenceUnavailable,

    #[error("Invalid budget: {0}")]
    InvalidBudget(String),
}

fn from_store(e: StoreError) -> CacheError {
    match e {
        StoreError::Unavailable => CacheError::PersistenceUnavailable,
        other => CacheError::Store(other),
    }
}

pub struct CacheManager {
    budget: watch::Sender<CacheBudget>,
    ledger: Arc<AccessLedger>,
    durable: Arc<DurableTier>,
    fetcher: FetchExecutor,
    window: WindowCache,
    sync: SyncManager,
}

impl CacheManager {
    /// Open the cache described by `config`, starting online.
    ///
    /// A store that fails to open is logged and the cache runs memory-only.
    /// Must be called from within a Tokio runtime.
    pub fn open(config: &Config, source: Arc<dyn ResourceSource>) -> Result<Self, CacheError> {
        config
            .budget
            .validate()
            .map_err(|e| CacheError::InvalidBudget(e.to_string()))?;

        let (budget_tx, budget_rx) = watch::channel(config.budget.clone());

        let opened =
            PersistentStore::open(&config.store, config.compression.clone(), budget_rx.clone());
        let (durable, ledger) = match opened {
            Ok(store) => {
                let store = Arc::new(store);
                let ledger = Arc::clone(store.ledger());
                (Arc::new(DurableTier::new(store)), ledger)
            }
            Err(e) => {
                warn!(
                    path = %config.store.path.display(),
                    error = %e,
                    "Persistent store unavailable; running memory-only"
                );
                (
                    Arc::new(DurableTier::memory_only()),
                    Arc::new(AccessLedger::in_memory()),
                )
            }
        };

        Ok(Self::assemble(config, budget_tx, budget_rx, ledger, durable, source))
    }

    /// A cache with no persistent tier at all.
    pub fn memory_only(
        config: &Config,
        source: Arc<dyn ResourceSource>,
    ) -> Result<Self, CacheError> {
        config
            .budget
            .validate()
            .map_err(|e| CacheError::InvalidBudget(e.to_string()))?;
        let (budget_tx, budget_rx) = watch::channel(config.budget.clone());
        Ok(Self::assemble(
            config,
            budget_tx,
            budget_rx,
            Arc::new(AccessLedger::in_memory()),
            Arc::new(DurableTier::memory_only()),
            source,
        ))
    }

    fn assemble(
        config: &Config,
        budget_tx: watch::Sender<CacheBudget>,
        budget_rx: watch::Receiver<CacheBudget>,
        ledger: Arc<AccessLedger>,
        durable: Arc<DurableTier>,
        source: Arc<dyn ResourceSource>,
    ) -> Self {
        let (online_tx, online_rx) = watch::channel(true);

        let fetcher = FetchExecutor::new(
            source,
            config.fetch.clone(),
            budget_rx.clone(),
            online_rx,
            Arc::clone(&ledger),
            Arc::clone(&durable),
        );
        let window = WindowCache::new(fetcher.clone(), budget_rx.clone());
        let reconciler = Arc::new(CacheReconciler {
            window: window.clone(),
            durable: Arc::clone(&durable),
        });
        let sync = SyncManager::start(online_tx, budget_rx, reconciler);

        info!(
            persistent = durable.is_available(),
            durable_ledger = ledger.is_durable(),
            "Cache ready"
        );

        Self {
            budget: budget_tx,
            ledger,
            durable,
            fetcher,
            window,
            sync,
        }
    }

    pub fn set_keys(&self, keys: Vec<ResourceKey>) {
        self.window.set_keys(keys);
    }

    pub fn set_cursor(&self, index: usize) {
        self.window.set_cursor(index);
    }

    pub fn get(&self, key: &str) -> (WindowEntry, bool) {
        self.window.get(key)
    }

    pub fn peek(&self, key: &str) -> Option<WindowEntry> {
        self.window.peek(key)
    }

    /// Manually re-request an errored entry.
    pub fn retry(&self, key: &str) -> bool {
        self.window.retry(key)
    }

    /// Fetch outside the window; nothing is tracked in the window map.
    pub fn fetch(&self, key: &str, priority: FetchPriority) -> oneshot::Receiver<FetchResult> {
        self.fetcher.fetch(key, priority)
    }

    /// Persist `payload` directly. `priority` can raise, never lower, the ledger-derived one.
    pub async fn cache_persist(
        &self,
        key: &str,
        payload: Bytes,
        priority: Priority,
    ) -> Result<PersistentEntry, CacheError> {
        self.durable
            .put(key, payload, Some(priority))
            .await
            .map_err(from_store)
    }

    /// The persisted payload for `key`, counting as an access.
    pub async fn cache_get(&self, key: &str) -> Result<Option<Bytes>, CacheError> {
        Ok(self.cache_lookup(key).await?.map(|found| found.bytes))
    }

    /// Like [`cache_get`](Self::cache_get), with the entry's metadata.
    pub async fn cache_lookup(&self, key: &str) -> Result<Option<StoredPayload>, CacheError> {
        self.durable.try_get(key).await.map_err(from_store)
    }

    /// Empty the persistent tier and reset access counts. The window is kept.
    pub async fn clear(&self) -> Result<(), CacheError> {
        if self.durable.store().is_none() {
            self.ledger.clear().map_err(|e| CacheError::Store(e.into()))?;
            return Ok(());
        }
        self.durable.clear().await.map_err(from_store)
    }

    pub fn stats(&self) -> StatsSnapshot {
        let mut window = WindowStats::default();
        self.window.for_each_entry(|entry| window.add(entry));
        summarize(
            window,
            self.durable.usage(),
            self.durable.is_available(),
            self.fetcher.stats(),
            Some(self.sync.status()),
        )
    }

    pub fn budget(&self) -> CacheBudget {
        self.budget.borrow().clone()
    }

    /// Replace the budget; it applies from the next fetch or eviction.
    pub fn update_budget(&self, budget: CacheBudget) -> Result<(), CacheError> {
        budget
            .validate()
            .map_err(|e| CacheError::InvalidBudget(e.to_string()))?;
        info!(
            max_bytes = budget.max_bytes,
            max_entries = budget.max_entries,
            window_radius = budget.window_radius,
            "Budget updated"
        );
        self.budget.send_replace(budget);
        Ok(())
    }

    pub fn set_online(&self, online: bool) {
        self.sync.set_online(online);
    }

    pub fn is_online(&self) -> bool {
        self.sync.is_online()
    }

    pub fn sync_status(&self) -> SyncStatus {
        self.sync.status()
    }

    pub fn set_pending_count(&self, count: u64) {
        self.sync.set_pending_count(count);
    }

    pub async fn sync_now(&self) -> anyhow::Result<ReconcileReport> {
        self.sync.sync_now().await
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WindowEvent> {
        self.window.subscribe()
    }

    pub fn events(&self) -> BroadcastStream<WindowEvent> {
        self.window.events()
    }

    pub fn window(&self) -> &WindowCache {
        &self.window
    }

    pub fn durable(&self) -> &Arc<DurableTier> {
        &self.durable
    }

    /// Wait until background persistence writes have landed.
    pub async fn wait_idle(&self) {
        self.durable.wait_idle().await;
    }

    pub fn shutdown(&self) {
        self.sync.shutdown();
    }
}

/// Reconciliation over the window and the persistent tier.
struct CacheReconciler {
    window: WindowCache,
    durable: Arc<DurableTier>,
}

#[async_trait]
impl Reconciler for CacheReconciler {
    async fn reconcile(&self) -> anyhow::Result<ReconcileReport> {
        if self.durable.store().is_some() && !self.durable.is_available() {
            self.durable.probe().await;
        }

        let handles = self.window.refresh_stale();
        let requested = handles.len();
        let refreshed = futures::future::join_all(handles)
            .await
            .into_iter()
            .filter(|outcome| matches!(outcome, Ok(true)))
            .count();

        let evicted = if self.durable.is_available() {
            self.durable.enforce_budget().await?
        } else {
            0
        };

        Ok(ReconcileReport {
            requested,
            refreshed,
            evicted,
        })
    }
}
