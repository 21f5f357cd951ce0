//! Eviction policy for the persistent tier.
//!
//! Entries are ordered by `(priority rank, last access)`: low-priority entries
//! go first, and within a class the least recently accessed goes first.
//! `High` entries are never selected; only an explicit clear removes them.

use std::cmp::Ordering;

use crate::cache::entry::{classify, Priority, ResourceKey};

/// An entry the policy may remove, as read from the eviction index.
#[derive(Debug, Clone)]
pub struct EvictionCandidate {
    pub key: ResourceKey,
    pub priority: Priority,

    /// Logical access clock; smaller = older.
    pub access_seq: u64,

    pub size_bytes: u64,
    pub original_size_bytes: u64,
}

// Smaller = evicted sooner.
impl PartialEq for EvictionCandidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for EvictionCandidate {}

impl PartialOrd for EvictionCandidate {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for EvictionCandidate {
    fn cmp(&self, other: &Self) -> Ordering {
        self.priority
            .rank()
            .cmp(&other.priority.rank())
            .then(self.access_seq.cmp(&other.access_seq))
            .then_with(|| self.key.cmp(&other.key))
    }
}

/// How much must be freed before an insert fits.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Shortfall {
    pub bytes: u64,
    pub entries: usize,
}

impl Shortfall {
    pub fn is_empty(&self) -> bool {
        self.bytes == 0 && self.entries == 0
    }
}

/// Result of a victim selection.
#[derive(Debug, Clone)]
pub struct Selection {
    pub victims: Vec<EvictionCandidate>,

    /// What is still missing after removing every victim. Empty when satisfied.
    pub remaining: Shortfall,
}

impl Selection {
    pub fn is_satisfied(&self) -> bool {
        self.remaining.is_empty()
    }
}

/// The eviction policy engine.
#[derive(Debug, Clone)]
pub struct Evictor {
    priority_threshold: u64,
}

impl Evictor {
    pub fn new(priority_threshold: u64) -> Self {
        Self { priority_threshold }
    }

    /// Priority for an access count under the current threshold.
    pub fn classify(&self, access_count: u64) -> Priority {
        classify(access_count, self.priority_threshold)
    }

    /// Walk `candidates` in eviction order, taking non-`High` entries until
    /// `needed` is covered.
    ///
    /// `candidates` must already be sorted (the store reads them from its
    /// sorted index); use [`sort_candidates`] otherwise. `exclude` names a key
    /// that must survive, typically the one being replaced.
    pub fn select_victims(
        &self,
        candidates: impl IntoIterator<Item = EvictionCandidate>,
        needed: Shortfall,
        exclude: Option<&str>,
    ) -> Selection {
        let mut victims = Vec::new();
        let mut remaining = needed;

        if remaining.is_empty() {
            return Selection { victims, remaining };
        }

        for candidate in candidates {
            if candidate.priority.is_protected() {
                continue;
            }
            if exclude == Some(candidate.key.as_str()) {
                continue;
            }

            remaining.bytes = remaining.bytes.saturating_sub(candidate.size_bytes);
            remaining.entries = remaining.entries.saturating_sub(1);
            victims.push(candidate);

            if remaining.is_empty() {
                break;
            }
        }

        Selection { victims, remaining }
    }
}

/// Sort candidates into eviction order.
pub fn sort_candidates(candidates: &mut [EvictionCandidate]) {
    candidates.sort();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn candidate(key: &str, priority: Priority, seq: u64, size: u64) -> EvictionCandidate {
        EvictionCandidate {
            key: key.to_string(),
            priority,
            access_seq: seq,
            size_bytes: size,
            original_size_bytes: size,
        }
    }

    #[test]
    fn test_order_priority_then_age() {
        let mut candidates = vec![
            candidate("m-old", Priority::Medium, 1, 10),
            candidate("l-new", Priority::Low, 9, 10),
            candidate("h", Priority::High, 0, 10),
            candidate("l-old", Priority::Low, 2, 10),
        ];
        sort_candidates(&mut candidates);
        let keys: Vec<_> = candidates.iter().map(|c| c.key.as_str()).collect();
        assert_eq!(keys, vec!["l-old", "l-new", "m-old", "h"]);
    }

    #[test]
    fn test_high_never_selected() {
        let evictor = Evictor::new(3);
        let candidates = vec![
            candidate("h1", Priority::High, 0, 100),
            candidate("l", Priority::Low, 5, 10),
            candidate("h2", Priority::High, 1, 100),
        ];

        let selection = evictor.select_victims(
            candidates,
            Shortfall {
                bytes: 50,
                entries: 0,
            },
            None,
        );
        assert_eq!(selection.victims.len(), 1);
        assert_eq!(selection.victims[0].key, "l");
        assert!(!selection.is_satisfied());
        assert_eq!(selection.remaining.bytes, 40);
    }

    #[test]
    fn test_stops_once_satisfied() {
        let evictor = Evictor::new(3);
        let mut candidates = vec![
            candidate("a", Priority::Low, 1, 10),
            candidate("b", Priority::Low, 2, 10),
            candidate("c", Priority::Medium, 3, 10),
        ];
        sort_candidates(&mut candidates);

        let selection = evictor.select_victims(
            candidates,
            Shortfall {
                bytes: 0,
                entries: 1,
            },
            None,
        );
        assert!(selection.is_satisfied());
        assert_eq!(selection.victims.len(), 1);
        assert_eq!(selection.victims[0].key, "a");
    }

    #[test]
    fn test_excluded_key_survives() {
        let evictor = Evictor::new(3);
        let candidates = vec![
            candidate("a", Priority::Low, 1, 10),
            candidate("b", Priority::Low, 2, 10),
        ];
        let selection = evictor.select_victims(
            candidates,
            Shortfall {
                bytes: 0,
                entries: 1,
            },
            Some("a"),
        );
        assert_eq!(selection.victims[0].key, "b");
    }

    #[test]
    fn test_nothing_needed_selects_nothing() {
        let evictor = Evictor::new(3);
        let selection = evictor.select_victims(
            vec![candidate("a", Priority::Low, 1, 10)],
            Shortfall::default(),
            None,
        );
        assert!(selection.victims.is_empty());
        assert!(selection.is_satisfied());
    }
}
