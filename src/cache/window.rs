//! Window cache: keeps the keys around a cursor warm in memory.
//!
//! Given an ordered key list and a cursor, the window is the cursor key and
//! its neighbours out to `window_radius`. The cursor and ±1 are fetched at
//! `High` priority, the rest at `Low`. Entries outside the window stay until
//! the map exceeds `window_max_entries`, then the least recently touched go
//! first.
//!
//! Every fetch request stamps its entry with a sequence number. A result is
//! applied only while the entry still carries that number, so late results
//! for pruned or re-requested keys are dropped.

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;
use tokio_stream::wrappers::BroadcastStream;
use tracing::debug;

use crate::cache::entry::{FetchPriority, LoadSource, LoadState, ResourceKey, WindowEntry};
use crate::config::CacheBudget;
use crate::transfer::fetcher::{FetchExecutor, FetchResult};

/// A change in the window, for consumers that re-render on change.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WindowEvent {
    StateChanged { key: ResourceKey, state: LoadState },
    Removed { key: ResourceKey },
}

/// Indices to keep warm, cursor first, then by increasing distance.
pub fn compute_window(cursor: usize, len: usize, radius: usize) -> Vec<(usize, FetchPriority)> {
    if cursor >= len {
        return Vec::new();
    }

    // Past this distance both sides are out of range.
    let reach = radius.min(cursor.max(len - 1 - cursor));
    let mut window = Vec::with_capacity(reach.saturating_mul(2).saturating_add(1).min(len));
    window.push((cursor, FetchPriority::High));
    for distance in 1..=reach {
        let priority = if distance == 1 {
            FetchPriority::High
        } else {
            FetchPriority::Low
        };
        if let Some(before) = cursor.checked_sub(distance) {
            window.push((before, priority));
        }
        if let Some(after) = cursor.checked_add(distance).filter(|i| *i < len) {
            window.push((after, priority));
        }
    }
    window
}

#[derive(Default)]
struct WindowState {
    keys: Vec<ResourceKey>,
    cursor: Option<usize>,
    entries: HashMap<ResourceKey, WindowEntry>,

    /// Keys of the last computed window; never pruned.
    window_keys: HashSet<ResourceKey>,
}

struct Inner {
    fetcher: FetchExecutor,
    budget: watch::Receiver<CacheBudget>,
    state: Mutex<WindowState>,
    events: broadcast::Sender<WindowEvent>,
    next_seq: AtomicU64,
}

/// Cloneable handle to the window cache.
#[derive(Clone)]
pub struct WindowCache {
    inner: Arc<Inner>,
}

/// A fetch the window decided to issue, dispatched after the lock is released.
struct Request {
    key: ResourceKey,
    priority: FetchPriority,
    seq: u64,

    /// Keep the current payload on failure.
    refresh: bool,
}

impl WindowCache {
    pub fn new(fetcher: FetchExecutor, budget: watch::Receiver<CacheBudget>) -> Self {
        let (events, _) = broadcast::channel(256);
        Self {
            inner: Arc::new(Inner {
                fetcher,
                budget,
                state: Mutex::new(WindowState::default()),
                events,
                next_seq: AtomicU64::new(0),
            }),
        }
    }

    /// Replace the ordered key list. The window is recomputed if a cursor is set.
    pub fn set_keys(&self, keys: Vec<ResourceKey>) {
        let cursor = {
            let mut state = self.inner.state.lock();
            state.keys = keys;
            state.cursor
        };
        if let Some(cursor) = cursor {
            self.set_cursor(cursor);
        }
    }

    /// Move the cursor and recompute the window. Indices past the end clamp to the last key.
    pub fn set_cursor(&self, index: usize) {
        let budget = self.inner.budget.borrow().clone();

        let (requests, removed) = {
            let mut state = self.inner.state.lock();
            if state.keys.is_empty() {
                state.cursor = None;
                state.window_keys.clear();
                return;
            }
            let cursor = index.min(state.keys.len() - 1);
            state.cursor = Some(cursor);

            let window = compute_window(cursor, state.keys.len(), budget.window_radius);
            let window_keys: HashSet<ResourceKey> =
                window.iter().map(|(i, _)| state.keys[*i].clone()).collect();

            let mut requests = Vec::new();
            for (i, priority) in window {
                let key = state.keys[i].clone();
                let entry = state
                    .entries
                    .entry(key.clone())
                    .or_insert_with(|| WindowEntry::unloaded(key.clone()));
                entry.touch();
                if entry.needs_fetch() {
                    requests.push(self.begin(entry, priority, false));
                }
            }

            let removed = prune(&mut state.entries, budget.window_max_entries, |key| {
                window_keys.contains(key)
            });
            state.window_keys = window_keys;
            (requests, removed)
        };

        self.notify_removed(removed);
        for request in requests {
            self.dispatch(request);
        }
    }

    /// Current view of `key` and whether it was already tracked.
    ///
    /// An untracked key is returned as `Unloaded` and a `High` fetch is
    /// requested for it.
    pub fn get(&self, key: &str) -> (WindowEntry, bool) {
        let max_entries = self.inner.budget.borrow().window_max_entries;

        let (request, removed) = {
            let mut state = self.inner.state.lock();
            if let Some(entry) = state.entries.get_mut(key) {
                entry.touch();
                return (entry.clone(), true);
            }
            let entry = state
                .entries
                .entry(key.to_string())
                .or_insert_with(|| WindowEntry::unloaded(key));
            let request = self.begin(entry, FetchPriority::High, false);

            let WindowState {
                entries,
                window_keys,
                ..
            } = &mut *state;
            let removed = prune(entries, max_entries, |k| k == key || window_keys.contains(k));
            (request, removed)
        };

        self.notify_removed(removed);
        self.dispatch(request);
        (WindowEntry::unloaded(key), false)
    }

    /// Entry for `key` without side effects.
    pub fn peek(&self, key: &str) -> Option<WindowEntry> {
        self.inner.state.lock().entries.get(key).cloned()
    }

    /// Re-request an errored entry. Returns false if `key` is not in `Error`.
    pub fn retry(&self, key: &str) -> bool {
        let request = {
            let mut state = self.inner.state.lock();
            match state.entries.get_mut(key) {
                Some(entry) if entry.state == LoadState::Error => {
                    entry.reset();
                    entry.touch();
                    self.begin(entry, FetchPriority::High, false)
                }
                _ => return false,
            }
        };
        self.dispatch(request);
        true
    }

    /// Re-fetch errored entries and entries served from the persistent tier.
    ///
    /// Loaded entries keep their payload until the fresh copy arrives. The
    /// handles resolve to whether the refresh produced a network payload.
    pub fn refresh_stale(&self) -> Vec<JoinHandle<bool>> {
        let requests: Vec<Request> = {
            let mut state = self.inner.state.lock();
            let mut requests = Vec::new();
            for entry in state.entries.values_mut() {
                match entry.state {
                    LoadState::Error => {
                        entry.reset();
                        requests.push(self.begin(entry, FetchPriority::Low, false));
                    }
                    LoadState::Loaded if entry.source == Some(LoadSource::Persistent) => {
                        requests.push(self.begin(entry, FetchPriority::Low, true));
                    }
                    _ => {}
                }
            }
            requests
        };

        requests.into_iter().map(|r| self.dispatch(r)).collect()
    }

    pub fn cursor(&self) -> Option<usize> {
        self.inner.state.lock().cursor
    }

    pub fn len(&self) -> usize {
        self.inner.state.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.state.lock().entries.is_empty()
    }

    /// Visit every entry under the lock.
    pub fn for_each_entry(&self, mut f: impl FnMut(&WindowEntry)) {
        let state = self.inner.state.lock();
        for entry in state.entries.values() {
            f(entry);
        }
    }

    pub fn entries_snapshot(&self) -> Vec<WindowEntry> {
        self.inner.state.lock().entries.values().cloned().collect()
    }

    pub fn subscribe(&self) -> broadcast::Receiver<WindowEvent> {
        self.inner.events.subscribe()
    }

    /// Change notifications as a stream. Lagging consumers see errors, not gaps.
    pub fn events(&self) -> BroadcastStream<WindowEvent> {
        BroadcastStream::new(self.subscribe())
    }

    fn notify_removed(&self, removed: Vec<ResourceKey>) {
        for key in removed {
            debug!(key, "Pruned window entry");
            let _ = self.inner.events.send(WindowEvent::Removed { key });
        }
    }

    /// Stamp `entry` with a new request sequence and mark it loading.
    fn begin(&self, entry: &mut WindowEntry, priority: FetchPriority, refresh: bool) -> Request {
        let seq = self.inner.next_seq.fetch_add(1, Ordering::Relaxed) + 1;
        entry.request_seq = seq;
        if !refresh {
            entry.state = LoadState::Loading;
            entry.payload = None;
            entry.error = None;
            let _ = self.inner.events.send(WindowEvent::StateChanged {
                key: entry.key.clone(),
                state: LoadState::Loading,
            });
        }
        Request {
            key: entry.key.clone(),
            priority,
            seq,
            refresh,
        }
    }

    fn dispatch(&self, request: Request) -> JoinHandle<bool> {
        let rx = self.inner.fetcher.fetch(&request.key, request.priority);
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            let result = match rx.await {
                Ok(result) => result,
                Err(_) => Err(crate::transfer::fetcher::FetchError::Abandoned(
                    request.key.clone(),
                )),
            };
            inner.apply(&request, result)
        })
    }
}

impl Inner {
    /// Apply a fetch outcome if it is still the latest for its key.
    fn apply(&self, request: &Request, result: FetchResult) -> bool {
        let (state, network) = {
            let mut window = self.state.lock();
            let Some(entry) = window.entries.get_mut(&request.key) else {
                debug!(key = %request.key, seq = request.seq, "Discarding result for pruned entry");
                return false;
            };
            if entry.request_seq != request.seq {
                debug!(
                    key = %request.key,
                    seq = request.seq,
                    current = entry.request_seq,
                    "Discarding stale result"
                );
                return false;
            }

            match result {
                Ok(fetched) => {
                    let network = fetched.source == LoadSource::Network;
                    entry.state = LoadState::Loaded;
                    entry.payload = Some(fetched.bytes);
                    entry.natural_size = fetched.natural_size;
                    entry.load_latency_ms = Some(fetched.latency_ms);
                    entry.retry_count = fetched.attempts.saturating_sub(1);
                    entry.source = Some(fetched.source);
                    entry.error = None;
                    (LoadState::Loaded, network)
                }
                Err(e) if request.refresh => {
                    debug!(key = %request.key, error = %e, "Refresh failed; keeping payload");
                    return false;
                }
                Err(e) => {
                    entry.state = LoadState::Error;
                    entry.payload = None;
                    entry.retry_count = e.attempts();
                    entry.error = Some(e.to_string());
                    (LoadState::Error, false)
                }
            }
        };

        let _ = self.events.send(WindowEvent::StateChanged {
            key: request.key.clone(),
            state,
        });
        network
    }
}

/// Drop entries `keep` rejects, least recently touched first, until the map fits.
fn prune(
    entries: &mut HashMap<ResourceKey, WindowEntry>,
    max_entries: usize,
    keep: impl Fn(&str) -> bool,
) -> Vec<ResourceKey> {
    if entries.len() <= max_entries {
        return Vec::new();
    }

    let mut candidates: Vec<(std::time::Instant, ResourceKey)> = entries
        .values()
        .filter(|e| !keep(e.key.as_str()))
        .map(|e| (e.touched_at, e.key.clone()))
        .collect();
    candidates.sort();

    let excess = entries.len() - max_entries;
    let mut removed = Vec::with_capacity(excess.min(candidates.len()));
    for (_, key) in candidates.into_iter().take(excess) {
        entries.remove(&key);
        removed.push(key);
    }
    removed
}
