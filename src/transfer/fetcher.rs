//! Fetch executor: resolves one key with bounded retries.
//!
//! Guarantees at most one in-flight fetch per key. A request for a key that is
//! already being fetched joins the existing outcome instead of issuing a second
//! network call. `Low` priority fetches share a small number of slots; a
//! `High` request joining a queued `Low` fetch lets it skip the queue.
//!
//! Resolution:
//! - offline: the persistent tier, or a terminal `Offline` error
//! - online: the network, retried with exponential delay; when every attempt
//!   fails the persistent copy is served if there is one
//!
//! A network success records the access in the ledger and offers the payload
//! to the persistent tier in the background.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use bytes::Bytes;
use parking_lot::Mutex;
use rand::Rng;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::{oneshot, watch, Notify, Semaphore};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::cache::compressor::probe_dimensions;
use crate::cache::durable::DurableTier;
use crate::cache::entry::{FetchPriority, LoadSource, NaturalSize, ResourceKey};
use crate::cache::ledger::AccessLedger;
use crate::cache::store::StoredPayload;
use crate::config::{CacheBudget, FetchConfig};
use crate::transfer::source::{ResourceSource, SourceError};

#[derive(Error, Debug, Clone)]
pub enum FetchError {
    /// One failed attempt. Retried internally, never delivered to callers.
    #[error("Attempt {attempt} failed: {source}")]
    Transient {
        attempt: u32,
        #[source]
        source: SourceError,
    },

    #[error("Fetch of {key} failed after {attempts} attempt(s): {last}")]
    Terminal {
        key: ResourceKey,
        attempts: u32,
        last: SourceError,
    },

    #[error("Offline and {0} is not in the persistent tier")]
    Offline(ResourceKey),

    #[error("Fetch of {0} was abandoned before completing")]
    Abandoned(ResourceKey),
}

impl FetchError {
    /// Failed attempts behind this error.
    pub fn attempts(&self) -> u32 {
        match self {
            FetchError::Terminal { attempts, .. } => *attempts,
            FetchError::Transient { attempt, .. } => *attempt,
            FetchError::Offline(_) | FetchError::Abandoned(_) => 0,
        }
    }
}

/// A resolved payload.
#[derive(Debug, Clone)]
pub struct Fetched {
    pub key: ResourceKey,
    pub bytes: Bytes,
    pub source: LoadSource,
    pub natural_size: Option<NaturalSize>,
    pub latency_ms: u64,

    /// Network attempts made (zero when served from the persistent tier while offline).
    pub attempts: u32,
}

pub type FetchResult = Result<Fetched, FetchError>;

#[derive(Debug, Default)]
struct FetchCounters {
    requests: AtomicU64,
    joined: AtomicU64,
    attempts: AtomicU64,
    successes: AtomicU64,
    failures: AtomicU64,
    persistent_serves: AtomicU64,
}

/// Point-in-time copy of the executor counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FetchStats {
    pub requests: u64,

    /// Requests that attached to an already in-flight fetch.
    pub joined: u64,

    pub attempts: u64,
    pub successes: u64,
    pub failures: u64,
    pub persistent_serves: u64,
    pub in_flight: u64,
}

struct InFlight {
    waiters: Vec<oneshot::Sender<FetchResult>>,
    promote: Arc<Notify>,
}

struct Inner {
    source: Arc<dyn ResourceSource>,
    config: FetchConfig,
    budget: watch::Receiver<CacheBudget>,
    online: watch::Receiver<bool>,
    ledger: Arc<AccessLedger>,
    durable: Arc<DurableTier>,

    in_flight: Mutex<HashMap<ResourceKey, InFlight>>,
    low_slots: Semaphore,
    counters: FetchCounters,
}

/// Cloneable handle to the executor.
#[derive(Clone)]
pub struct FetchExecutor {
    inner: Arc<Inner>,
}

impl FetchExecutor {
    pub fn new(
        source: Arc<dyn ResourceSource>,
        config: FetchConfig,
        budget: watch::Receiver<CacheBudget>,
        online: watch::Receiver<bool>,
        ledger: Arc<AccessLedger>,
        durable: Arc<DurableTier>,
    ) -> Self {
        let low_slots = Semaphore::new(config.low_priority_slots.max(1));
        Self {
            inner: Arc::new(Inner {
                source,
                config,
                budget,
                online,
                ledger,
                durable,
                in_flight: Mutex::new(HashMap::new()),
                low_slots,
                counters: FetchCounters::default(),
            }),
        }
    }

    /// Request `key`; the receiver yields the shared outcome.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn fetch(&self, key: &str, priority: FetchPriority) -> oneshot::Receiver<FetchResult> {
        let (tx, rx) = oneshot::channel();
        self.inner.counters.requests.fetch_add(1, Ordering::Relaxed);

        let promote = {
            let mut in_flight = self.inner.in_flight.lock();
            if let Some(existing) = in_flight.get_mut(key) {
                existing.waiters.push(tx);
                if priority == FetchPriority::High {
                    existing.promote.notify_one();
                }
                self.inner.counters.joined.fetch_add(1, Ordering::Relaxed);
                debug!(key, ?priority, "Joined in-flight fetch");
                return rx;
            }

            let promote = Arc::new(Notify::new());
            in_flight.insert(
                key.to_string(),
                InFlight {
                    waiters: vec![tx],
                    promote: Arc::clone(&promote),
                },
            );
            promote
        };

        let inner = Arc::clone(&self.inner);
        let key = key.to_string();
        tokio::spawn(async move {
            let request_id = Uuid::new_v4();
            let result = inner.run(&key, priority, promote, request_id).await;

            let waiters = inner
                .in_flight
                .lock()
                .remove(&key)
                .map(|f| f.waiters)
                .unwrap_or_default();
            for waiter in waiters {
                let _ = waiter.send(result.clone());
            }
        });

        rx
    }

    /// [`fetch`](Self::fetch) and wait for the outcome.
    pub async fn fetch_wait(&self, key: &str, priority: FetchPriority) -> FetchResult {
        self.fetch(key, priority)
            .await
            .unwrap_or_else(|_| Err(FetchError::Abandoned(key.to_string())))
    }

    pub fn is_in_flight(&self, key: &str) -> bool {
        self.inner.in_flight.lock().contains_key(key)
    }

    pub fn in_flight_count(&self) -> usize {
        self.inner.in_flight.lock().len()
    }

    pub fn is_online(&self) -> bool {
        *self.inner.online.borrow()
    }

    pub fn stats(&self) -> FetchStats {
        let c = &self.inner.counters;
        FetchStats {
            requests: c.requests.load(Ordering::Relaxed),
            joined: c.joined.load(Ordering::Relaxed),
            attempts: c.attempts.load(Ordering::Relaxed),
            successes: c.successes.load(Ordering::Relaxed),
            failures: c.failures.load(Ordering::Relaxed),
            persistent_serves: c.persistent_serves.load(Ordering::Relaxed),
            in_flight: self.in_flight_count() as u64,
        }
    }
}

impl Inner {
    async fn run(
        &self,
        key: &str,
        priority: FetchPriority,
        promote: Arc<Notify>,
        request_id: Uuid,
    ) -> FetchResult {
        let started = Instant::now();

        // Held for the whole fetch; `None` for High or promoted requests.
        let _slot = match priority {
            FetchPriority::High => None,
            FetchPriority::Low => tokio::select! {
                permit = self.low_slots.acquire() => permit.ok(),
                _ = promote.notified() => {
                    debug!(key, %request_id, "Low priority fetch promoted");
                    None
                }
            },
        };

        let result = if *self.online.borrow() {
            self.from_network(key, started, request_id).await
        } else {
            match self.durable.get(key).await {
                Some(stored) => Ok(self.serve_persisted(key, stored, started, 0)),
                None => Err(FetchError::Offline(key.to_string())),
            }
        };

        match &result {
            Ok(fetched) => {
                self.counters.successes.fetch_add(1, Ordering::Relaxed);
                debug!(
                    key,
                    %request_id,
                    source = ?fetched.source,
                    latency_ms = fetched.latency_ms,
                    attempts = fetched.attempts,
                    "Fetch complete"
                );
            }
            Err(e) => {
                self.counters.failures.fetch_add(1, Ordering::Relaxed);
                info!(key, %request_id, error = %e, "Fetch failed");
            }
        }
        result
    }

    async fn from_network(&self, key: &str, started: Instant, request_id: Uuid) -> FetchResult {
        let budget = self.budget.borrow().clone();
        let max_attempts = budget.attempts();
        let timeout = self.config.attempt_timeout();

        let mut attempts = 0;
        let mut last = None;
        while attempts < max_attempts {
            attempts += 1;
            self.counters.attempts.fetch_add(1, Ordering::Relaxed);

            let outcome = match tokio::time::timeout(timeout, self.source.fetch(key)).await {
                Ok(outcome) => outcome,
                Err(_) => Err(SourceError::Timeout(timeout)),
            };

            match outcome {
                Ok(bytes) => {
                    let ledger = Arc::clone(&self.ledger);
                    let owned = key.to_string();
                    let count = tokio::task::spawn_blocking(move || ledger.record(&owned))
                        .await
                        .unwrap_or_default();
                    debug!(key, %request_id, count, "Access recorded");
                    self.durable.offer(key, bytes.clone(), None);
                    return Ok(Fetched {
                        key: key.to_string(),
                        natural_size: probe_dimensions(&bytes),
                        bytes,
                        source: LoadSource::Network,
                        latency_ms: started.elapsed().as_millis() as u64,
                        attempts,
                    });
                }
                Err(source) => {
                    let retryable = source.is_retryable();
                    let failure = FetchError::Transient {
                        attempt: attempts,
                        source: source.clone(),
                    };
                    debug!(key, %request_id, retryable, error = %failure, "Fetch attempt failed");
                    last = Some(source);

                    if !retryable || attempts >= max_attempts {
                        break;
                    }
                    tokio::time::sleep(self.retry_delay(&budget, attempts)).await;
                }
            }
        }

        let last = last.unwrap_or_else(|| SourceError::Network("no attempt made".to_string()));

        if let Some(stored) = self.durable.get(key).await {
            warn!(key, %request_id, error = %last, "Network exhausted; serving persisted copy");
            return Ok(self.serve_persisted(key, stored, started, attempts));
        }

        Err(FetchError::Terminal {
            key: key.to_string(),
            attempts,
            last,
        })
    }

    fn serve_persisted(
        &self,
        key: &str,
        stored: StoredPayload,
        started: Instant,
        attempts: u32,
    ) -> Fetched {
        self.counters
            .persistent_serves
            .fetch_add(1, Ordering::Relaxed);
        let natural_size = stored
            .entry
            .metadata
            .dimensions
            .or_else(|| probe_dimensions(&stored.bytes));
        Fetched {
            key: key.to_string(),
            bytes: stored.bytes,
            source: LoadSource::Persistent,
            natural_size,
            latency_ms: started.elapsed().as_millis() as u64,
            attempts,
        }
    }

    /// `retry_delay · 2^(attempt-1)`, capped, plus jitter.
    fn retry_delay(&self, budget: &CacheBudget, attempt: u32) -> Duration {
        let base = budget.retry_delay_ms;
        let factor = 1u64 << (attempt.saturating_sub(1)).min(20);
        let delay = base
            .saturating_mul(factor)
            .min(self.config.max_retry_delay_ms.max(base));
        let jitter = if self.config.retry_jitter_ms > 0 {
            rand::rng().random_range(0..=self.config.retry_jitter_ms)
        } else {
            0
        };
        Duration::from_millis(delay + jitter)
    }
}
