//! Sync manager: connectivity and reconciliation passes.
//!
//! Connectivity is a `watch<bool>` shared with the fetch executor. A
//! background task runs one reconciliation pass whenever the cache comes back
//! online, and then one every `sync_interval_minutes` while it stays online.
//! Both only happen when `auto_sync` is set in the live budget. Passes never
//! overlap.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::CacheBudget;

/// The work done by one reconciliation pass.
#[async_trait]
pub trait Reconciler: Send + Sync + 'static {
    async fn reconcile(&self) -> anyhow::Result<ReconcileReport>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileReport {
    /// Window entries re-requested from the network.
    pub requested: usize,

    /// Requests that came back with a fresh network payload.
    pub refreshed: usize,

    /// Persistent entries evicted to restore the budget.
    pub evicted: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SyncStatus {
    pub online: bool,
    pub last_sync_at: Option<DateTime<Utc>>,
    pub pending_count: u64,
    pub syncing: bool,
}

struct Shared {
    online: watch::Sender<bool>,
    budget: watch::Receiver<CacheBudget>,
    reconciler: Arc<dyn Reconciler>,

    pass_lock: tokio::sync::Mutex<()>,
    last_sync_at: Mutex<Option<DateTime<Utc>>>,
    pending: AtomicU64,
    syncing: AtomicBool,
    passes: AtomicU64,
}

pub struct SyncManager {
    shared: Arc<Shared>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl SyncManager {
    /// Spawn the background task. Must be called from within a Tokio runtime.
    pub fn start(
        online: watch::Sender<bool>,
        budget: watch::Receiver<CacheBudget>,
        reconciler: Arc<dyn Reconciler>,
    ) -> Self {
        let shared = Arc::new(Shared {
            online,
            budget,
            reconciler,
            pass_lock: tokio::sync::Mutex::new(()),
            last_sync_at: Mutex::new(None),
            pending: AtomicU64::new(0),
            syncing: AtomicBool::new(false),
            passes: AtomicU64::new(0),
        });
        let task = tokio::spawn(Arc::clone(&shared).run());
        Self {
            shared,
            task: Mutex::new(Some(task)),
        }
    }

    pub fn set_online(&self, online: bool) {
        let changed = self.shared.online.send_if_modified(|current| {
            if *current == online {
                return false;
            }
            *current = online;
            true
        });
        if changed {
            info!(online, "Connectivity changed");
        }
    }

    pub fn is_online(&self) -> bool {
        *self.shared.online.borrow()
    }

    /// Items awaiting upload, as reported by external upload logic.
    pub fn pending_count(&self) -> u64 {
        self.shared.pending.load(Ordering::Relaxed)
    }

    pub fn set_pending_count(&self, count: u64) {
        self.shared.pending.store(count, Ordering::Relaxed);
    }

    pub fn last_sync_at(&self) -> Option<DateTime<Utc>> {
        *self.shared.last_sync_at.lock()
    }

    /// Completed passes, successful or not.
    pub fn passes(&self) -> u64 {
        self.shared.passes.load(Ordering::Relaxed)
    }

    pub fn status(&self) -> SyncStatus {
        SyncStatus {
            online: self.is_online(),
            last_sync_at: self.last_sync_at(),
            pending_count: self.pending_count(),
            syncing: self.shared.syncing.load(Ordering::Relaxed),
        }
    }

    /// Run a pass now, regardless of `auto_sync`. Fails while offline.
    pub async fn sync_now(&self) -> anyhow::Result<ReconcileReport> {
        if !self.is_online() {
            anyhow::bail!("cannot reconcile while offline");
        }
        self.shared.pass("manual").await
    }

    /// Stop the background task. Idempotent.
    pub fn shutdown(&self) {
        if let Some(task) = self.task.lock().take() {
            task.abort();
            debug!("Sync task stopped");
        }
    }
}

impl Drop for SyncManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Shared {
    async fn run(self: Arc<Self>) {
        let mut online = self.online.subscribe();
        let mut budget = self.budget.clone();
        let mut was_online = *online.borrow_and_update();
        let mut anchor = tokio::time::Instant::now();

        loop {
            let (auto_sync, interval) = {
                let b = budget.borrow_and_update();
                (b.auto_sync, b.sync_interval())
            };
            let deadline = anchor + interval;
            let periodic = was_online && auto_sync;

            tokio::select! {
                changed = online.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let now_online = *online.borrow_and_update();
                    if now_online && !was_online && auto_sync {
                        let _ = self.pass("reconnect").await;
                    }
                    was_online = now_online;
                    anchor = tokio::time::Instant::now();
                }
                changed = budget.changed() => {
                    // Loop around to pick up the new interval against the same anchor.
                    if changed.is_err() {
                        break;
                    }
                }
                _ = tokio::time::sleep_until(deadline), if periodic => {
                    let _ = self.pass("periodic").await;
                    anchor = tokio::time::Instant::now();
                }
            }
        }
        debug!("Sync task exiting: channel closed");
    }

    async fn pass(&self, trigger: &'static str) -> anyhow::Result<ReconcileReport> {
        let _guard = self.pass_lock.lock().await;
        self.syncing.store(true, Ordering::Relaxed);
        let started = Instant::now();

        let result = self.reconciler.reconcile().await;

        self.syncing.store(false, Ordering::Relaxed);
        self.passes.fetch_add(1, Ordering::Relaxed);
        match &result {
            Ok(report) => {
                *self.last_sync_at.lock() = Some(Utc::now());
                info!(
                    trigger,
                    requested = report.requested,
                    refreshed = report.refreshed,
                    evicted = report.evicted,
                    elapsed_ms = started.elapsed().as_millis() as u64,
                    "Reconciliation pass complete"
                );
            }
            Err(e) => warn!(trigger, error = %e, "Reconciliation pass failed"),
        }
        result
    }
}
