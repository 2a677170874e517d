//! Eviction policy: decides which entry to drop when a store is full.
//!
//! Frequency weighted by recency:
//!
//! ```text
//! score(entry) = access_count / (1 + minutes_since_last_access)
//! ```
//!
//! The entry with the lowest score is evicted. Ties go to whichever entry the
//! iterator yields first, which is unspecified for hash-map iteration.

use std::collections::BinaryHeap;

use tokio::time::Instant;

use crate::cache::entry::{CacheEntry, Tier};

/// An eviction candidate with its computed score.
#[derive(Debug, Clone)]
pub struct EvictionCandidate {
    pub key: String,
    pub score: f64,
    pub tier: Tier,
}

// Lower score = higher eviction priority, so the heap ordering is reversed.
impl PartialEq for EvictionCandidate {
    fn eq(&self, other: &Self) -> bool {
        self.score == other.score
    }
}

impl Eq for EvictionCandidate {}

impl PartialOrd for EvictionCandidate {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for EvictionCandidate {
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .score
            .partial_cmp(&self.score)
            .unwrap_or(std::cmp::Ordering::Equal)
    }
}

/// The eviction policy engine.
#[derive(Debug, Default, Clone, Copy)]
pub struct Evictor;

impl Evictor {
    pub fn new() -> Self {
        Self
    }

    /// Compute the retention score of a single entry.
    pub fn compute_score<V>(&self, entry: &CacheEntry<V>, now: Instant) -> f64 {
        let idle_minutes = entry.idle(now).as_secs_f64() / 60.0;
        entry.access_count as f64 / (1.0 + idle_minutes)
    }

    /// Pick the single entry with the lowest score.
    pub fn select_victim<'a, V: 'a>(
        &self,
        entries: impl Iterator<Item = &'a CacheEntry<V>>,
        now: Instant,
    ) -> Option<EvictionCandidate> {
        let mut best: Option<EvictionCandidate> = None;
        for entry in entries {
            let score = self.compute_score(entry, now);
            if best.as_ref().map_or(true, |b| score < b.score) {
                best = Some(EvictionCandidate {
                    key: entry.key.clone(),
                    score,
                    tier: entry.tier,
                });
            }
        }
        best
    }

    /// Rank up to `count` entries by eviction priority (lowest score first).
    pub fn select_victims<'a, V: 'a>(
        &self,
        entries: impl Iterator<Item = &'a CacheEntry<V>>,
        count: usize,
        now: Instant,
    ) -> Vec<EvictionCandidate> {
        let mut heap: BinaryHeap<EvictionCandidate> = entries
            .map(|entry| EvictionCandidate {
                key: entry.key.clone(),
                score: self.compute_score(entry, now),
                tier: entry.tier,
            })
            .collect();

        let mut victims = Vec::with_capacity(count.min(heap.len()));
        while victims.len() < count {
            match heap.pop() {
                Some(candidate) => victims.push(candidate),
                None => break,
            }
        }
        victims
    }
}
