//! Cache entry store: key → entry mapping with lazy expiry and bounded size.
//!
//! The store is synchronous and never suspends. It:
//! - Answers point lookups, updating access bookkeeping and tier on hit
//! - Drops expired entries when they are read (and on explicit sweeps)
//! - Evicts exactly one entry when an insert would exceed `max_size`
//! - Keeps counters for monitoring

use std::collections::HashMap;

use serde::Serialize;
use tokio::time::Instant;
use tracing::debug;

use crate::cache::entry::{CacheEntry, Tier};
use crate::cache::evictor::{EvictionCandidate, Evictor};
use crate::config::CacheConfig;
use crate::error::ConfigError;

/// Point-in-time statistics for one store.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    /// Number of live entries (expired-but-unread entries included).
    pub entries: usize,
    /// Configured capacity.
    pub capacity: usize,
    /// Entries per tier.
    pub hot: usize,
    pub warm: usize,
    pub cold: usize,
    /// Successful reads.
    pub hits: u64,
    /// Reads that found nothing (including expired entries).
    pub misses: u64,
    /// Entries dropped because their TTL elapsed.
    pub expirations: u64,
    /// Entries dropped to make room.
    pub evictions: u64,
    /// Writes of keys that were not present.
    pub inserts: u64,
}

impl StoreStats {
    /// Fraction of reads that were hits (0.0 when nothing was read).
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            return 0.0;
        }
        self.hits as f64 / total as f64
    }
}

#[derive(Debug, Default)]
struct Counters {
    hits: u64,
    misses: u64,
    expirations: u64,
    evictions: u64,
    inserts: u64,
}

/// A bounded, tiered key-value store.
#[derive(Debug)]
pub struct CacheStore<V> {
    /// All entries indexed by key.
    entries: HashMap<String, CacheEntry<V>>,

    /// Eviction policy.
    evictor: Evictor,

    /// Tuning.
    config: CacheConfig,

    counters: Counters,
}

impl<V: Clone> CacheStore<V> {
    /// Create a store, rejecting invalid tuning.
    pub fn new(config: CacheConfig) -> Result<Self, ConfigError> {
        config.validate()?;
        Ok(Self {
            entries: HashMap::with_capacity(config.max_size.min(1024)),
            evictor: Evictor::new(),
            config,
            counters: Counters::default(),
        })
    }

    /// Look up a key, recording the access on hit.
    ///
    /// Returns `None` for unknown keys and for entries past their tier's TTL;
    /// the latter are removed.
    pub fn get(&mut self, key: &str) -> Option<V> {
        let now = Instant::now();

        let expired = match self.entries.get(key) {
            Some(entry) => entry.is_expired(now, &self.config),
            None => {
                self.counters.misses += 1;
                return None;
            }
        };

        if expired {
            self.entries.remove(key);
            self.counters.expirations += 1;
            self.counters.misses += 1;
            debug!(key, "Entry expired on read");
            return None;
        }

        let entry = self.entries.get_mut(key)?;
        entry.touch(now, &self.config);
        self.counters.hits += 1;
        Some(entry.value.clone())
    }

    /// Insert or overwrite a value.
    ///
    /// A new key arriving at capacity evicts one entry first; the evicted key
    /// is returned. Overwriting a live key keeps its access count.
    pub fn set(&mut self, key: String, value: V) -> Option<EvictionCandidate> {
        let now = Instant::now();

        let prior_count = match self.entries.get(&key) {
            Some(entry) if !entry.is_expired(now, &self.config) => Some(entry.access_count),
            Some(_) => {
                self.entries.remove(&key);
                self.counters.expirations += 1;
                None
            }
            None => None,
        };

        let mut evicted = None;
        if prior_count.is_none() {
            if self.entries.len() >= self.config.max_size {
                evicted = self.evict_one(now);
            }
            self.counters.inserts += 1;
        }

        let entry = match prior_count {
            Some(count) => CacheEntry::with_access_count(key.clone(), value, count, &self.config),
            None => CacheEntry::new(key.clone(), value, &self.config),
        };
        self.entries.insert(key, entry);
        evicted
    }

    /// Remove a key. Returns whether it was present.
    pub fn delete(&mut self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    /// Remove every entry.
    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Remove every entry whose key satisfies `predicate`.
    pub fn remove_matching(&mut self, predicate: impl Fn(&str) -> bool) -> usize {
        let before = self.entries.len();
        self.entries.retain(|key, _| !predicate(key));
        before - self.entries.len()
    }

    /// Drop all expired entries. Returns how many were removed.
    pub fn sweep_expired(&mut self) -> usize {
        let now = Instant::now();
        let config = &self.config;
        let before = self.entries.len();
        self.entries.retain(|_, entry| !entry.is_expired(now, config));
        let removed = before - self.entries.len();
        self.counters.expirations += removed as u64;
        removed
    }

    /// Inspect an entry without touching it.
    pub fn peek(&self, key: &str) -> Option<&CacheEntry<V>> {
        self.entries.get(key)
    }

    /// Whether a key is present (expired or not).
    pub fn contains_key(&self, key: &str) -> bool {
        self.entries.contains_key(key)
    }

    /// Number of stored entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the store is empty.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Store tuning.
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Snapshot of counters and tier occupancy.
    pub fn stats(&self) -> StoreStats {
        let mut stats = StoreStats {
            entries: self.entries.len(),
            capacity: self.config.max_size,
            hits: self.counters.hits,
            misses: self.counters.misses,
            expirations: self.counters.expirations,
            evictions: self.counters.evictions,
            inserts: self.counters.inserts,
            ..Default::default()
        };
        for entry in self.entries.values() {
            match entry.tier {
                Tier::Hot => stats.hot += 1,
                Tier::Warm => stats.warm += 1,
                Tier::Cold => stats.cold += 1,
            }
        }
        stats
    }

    fn evict_one(&mut self, now: Instant) -> Option<EvictionCandidate> {
        let victim = self.evictor.select_victim(self.entries.values(), now)?;
        self.entries.remove(&victim.key);
        self.counters.evictions += 1;
        debug!(
            key = %victim.key,
            score = victim.score,
            tier = %victim.tier,
            "Evicted entry"
        );
        Some(victim)
    }
}
