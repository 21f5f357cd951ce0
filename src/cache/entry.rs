//! Entry types shared by both tiers.
//!
//! A resource is an opaque byte payload identified by a string key. The memory
//! tier tracks a [`WindowEntry`] per key around the cursor; the durable tier
//! keeps a [`PersistentEntry`] per cached key. The two are independent views of
//! the same [`ResourceKey`].

use std::time::Instant;

use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Identifier of a remote resource. Never mutated.
pub type ResourceKey = String;

/// Eviction class of a persisted entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Priority {
    Low,
    Medium,
    High,
}

impl Priority {
    /// Sort rank used by the eviction index (lower = evicted first).
    pub fn rank(&self) -> u8 {
        match self {
            Priority::Low => 0,
            Priority::Medium => 1,
            Priority::High => 2,
        }
    }

    pub fn from_rank(rank: u8) -> Option<Priority> {
        match rank {
            0 => Some(Priority::Low),
            1 => Some(Priority::Medium),
            2 => Some(Priority::High),
            _ => None,
        }
    }

    /// Whether automatic eviction may remove entries of this class.
    pub fn is_protected(&self) -> bool {
        *self == Priority::High
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Priority::Low => write!(f, "low"),
            Priority::Medium => write!(f, "medium"),
            Priority::High => write!(f, "high"),
        }
    }
}

/// Urgency of a window fetch. The cursor and its neighbours are `High`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum FetchPriority {
    Low,
    High,
}

/// Lifecycle of a window entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum LoadState {
    Unloaded,
    Loading,
    Loaded,
    Error,
}

/// Which tier satisfied a load.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum LoadSource {
    Network,
    Persistent,
}

/// Pixel dimensions of an image payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct NaturalSize {
    pub width: u32,
    pub height: u32,
}

/// Memory-tier view of a resource.
#[derive(Debug, Clone)]
pub struct WindowEntry {
    pub key: ResourceKey,
    pub state: LoadState,

    /// Present only while `Loaded`.
    pub payload: Option<Bytes>,

    pub natural_size: Option<NaturalSize>,
    pub load_latency_ms: Option<u64>,

    /// Failed attempts of the latest request.
    pub retry_count: u32,

    pub source: Option<LoadSource>,

    /// Message of the terminal error, if any.
    pub error: Option<String>,

    /// Sequence number of the latest fetch request for this key.
    pub request_seq: u64,

    /// Last time the window computation or a reader touched this entry.
    pub touched_at: Instant,
}

impl WindowEntry {
    /// A fresh, untracked view of `key`.
    pub fn unloaded(key: impl Into<ResourceKey>) -> Self {
        Self {
            key: key.into(),
            state: LoadState::Unloaded,
            payload: None,
            natural_size: None,
            load_latency_ms: None,
            retry_count: 0,
            source: None,
            error: None,
            request_seq: 0,
            touched_at: Instant::now(),
        }
    }

    pub fn touch(&mut self) {
        self.touched_at = Instant::now();
    }

    /// Whether the window should request a fetch for this entry.
    ///
    /// Errored entries stay put until a manual retry.
    pub fn needs_fetch(&self) -> bool {
        self.state == LoadState::Unloaded
    }

    /// Drop the payload and return to `Unloaded`.
    pub fn reset(&mut self) {
        self.state = LoadState::Unloaded;
        self.payload = None;
        self.retry_count = 0;
        self.error = None;
    }
}

/// How a persisted payload is encoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StoredFormat {
    /// Re-encoded as JPEG at the configured quality.
    Jpeg,
    /// Stored exactly as received.
    Passthrough,
    /// Opaque bytes compressed with zstd.
    Zstd,
}

/// Provenance of a persisted payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntryMetadata {
    /// Dimensions of the stored image, if the payload is an image.
    pub dimensions: Option<NaturalSize>,
    pub original_size_bytes: u64,
    pub format: StoredFormat,

    /// Detected format of the input image (e.g. "png").
    pub source_format: Option<String>,

    /// Quality the payload was encoded at.
    pub quality: f32,
}

/// Durable-tier record of a resource.
#[derive(Debug, Clone)]
pub struct PersistentEntry {
    pub key: ResourceKey,

    /// Stored (encoded) bytes.
    pub payload: Bytes,

    pub size_bytes: u64,
    pub last_accessed_at: DateTime<Utc>,
    pub access_count: u64,
    pub priority: Priority,
    pub metadata: EntryMetadata,

    /// Logical clock stamped with `last_accessed_at`; orders ties in eviction.
    pub access_seq: u64,
}

/// Classify an access count into a priority.
///
/// `threshold` and above is `High`, two and above is `Medium`, anything less is `Low`.
pub fn classify(access_count: u64, threshold: u64) -> Priority {
    if access_count >= threshold {
        Priority::High
    } else if access_count >= 2 {
        Priority::Medium
    } else {
        Priority::Low
    }
}

/// Combine a computed priority with an optional explicit one. The override
/// only ever raises.
pub fn effective_priority(computed: Priority, explicit: Option<Priority>) -> Priority {
    match explicit {
        Some(p) => computed.max(p),
        None => computed,
    }
}
