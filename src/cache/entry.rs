//! Cache entry and tier definitions.
//!
//! An entry is the unit of storage, expiry and eviction. Its tier is derived
//! from how often it has been read and decides how long it may live.

use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;

use crate::config::CacheConfig;

/// Access-frequency bucket of an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    /// Read at least `hot_threshold` times; longest TTL.
    Hot,
    /// Read at least `warm_threshold` times.
    Warm,
    /// Everything else; shortest TTL.
    Cold,
}

impl Tier {
    /// Classify an access count against the configured thresholds.
    pub fn classify(access_count: u64, config: &CacheConfig) -> Tier {
        if access_count >= config.hot_threshold {
            Tier::Hot
        } else if access_count >= config.warm_threshold {
            Tier::Warm
        } else {
            Tier::Cold
        }
    }

    /// Time-to-live for entries in this tier.
    pub fn ttl(&self, config: &CacheConfig) -> Duration {
        let ms = match self {
            Tier::Hot => config.ttl_hot_ms,
            Tier::Warm => config.ttl_warm_ms,
            Tier::Cold => config.ttl_cold_ms,
        };
        Duration::from_millis(ms)
    }
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Tier::Hot => write!(f, "hot"),
            Tier::Warm => write!(f, "warm"),
            Tier::Cold => write!(f, "cold"),
        }
    }
}

/// Build a namespaced cache key such as `"profile:u1"`.
pub fn cache_key(namespace: &str, id: &str) -> String {
    format!("{namespace}:{id}")
}

/// Whether `key` names `id` as one of its `:`/`/`/`_`-separated segments.
///
/// `"pages:u1:recent"` mentions `"u1"` but not `"u"` or `"u10"`.
pub fn key_mentions(key: &str, id: &str) -> bool {
    !id.is_empty() && key.split([':', '/', '_']).any(|segment| segment == id)
}

/// A single cached value plus its access bookkeeping.
#[derive(Debug, Clone)]
pub struct CacheEntry<V> {
    /// Key the entry is stored under.
    pub key: String,

    /// Cached payload.
    pub value: V,

    /// When the value was written.
    pub created_at: Instant,

    /// Last successful read (or the write, if never read).
    pub last_accessed_at: Instant,

    /// Number of successful reads, counting the initial write as one.
    pub access_count: u64,

    /// Tier derived from `access_count`.
    pub tier: Tier,
}

impl<V> CacheEntry<V> {
    /// Create a fresh entry with an access count of one.
    pub fn new(key: String, value: V, config: &CacheConfig) -> Self {
        Self::with_access_count(key, value, 1, config)
    }

    /// Create an entry carrying over a previous access count.
    pub fn with_access_count(key: String, value: V, access_count: u64, config: &CacheConfig) -> Self {
        let now = Instant::now();
        let access_count = access_count.max(1);
        Self {
            key,
            value,
            created_at: now,
            last_accessed_at: now,
            access_count,
            tier: Tier::classify(access_count, config),
        }
    }

    /// Record a read, updating timestamp, counter and tier.
    pub fn touch(&mut self, now: Instant, config: &CacheConfig) {
        self.last_accessed_at = now.max(self.created_at);
        self.access_count = self.access_count.saturating_add(1);
        self.tier = Tier::classify(self.access_count, config);
    }

    /// Whether the entry has outlived its tier's TTL at `now`.
    pub fn is_expired(&self, now: Instant, config: &CacheConfig) -> bool {
        now.saturating_duration_since(self.created_at) > self.tier.ttl(config)
    }

    /// Time since the last read.
    pub fn idle(&self, now: Instant) -> Duration {
        now.saturating_duration_since(self.last_accessed_at)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> CacheConfig {
        CacheConfig {
            hot_threshold: 3,
            warm_threshold: 2,
            ..Default::default()
        }
    }

    #[test]
    fn test_tier_boundaries() {
        let cfg = config();
        assert_eq!(Tier::classify(1, &cfg), Tier::Cold);
        assert_eq!(Tier::classify(2, &cfg), Tier::Warm);
        assert_eq!(Tier::classify(3, &cfg), Tier::Hot);
        assert_eq!(Tier::classify(40, &cfg), Tier::Hot);
    }

    #[test]
    fn test_tier_ttls_follow_config() {
        let cfg = config();
        assert_eq!(Tier::Hot.ttl(&cfg), Duration::from_millis(cfg.ttl_hot_ms));
        assert_eq!(Tier::Cold.ttl(&cfg), Duration::from_millis(cfg.ttl_cold_ms));
    }

    #[test]
    fn test_touch_promotes() {
        let cfg = config();
        let mut entry = CacheEntry::new("profile:u1".to_string(), 7u32, &cfg);
        assert_eq!(entry.access_count, 1);
        assert_eq!(entry.tier, Tier::Cold);

        entry.touch(Instant::now(), &cfg);
        assert_eq!(entry.tier, Tier::Warm);
        entry.touch(Instant::now(), &cfg);
        assert_eq!(entry.tier, Tier::Hot);
        assert!(entry.last_accessed_at >= entry.created_at);
    }

    #[test]
    fn test_cache_key_format() {
        assert_eq!(cache_key("profile", "u1"), "profile:u1");
    }

    #[test]
    fn test_key_mentions_whole_segments() {
        assert!(key_mentions("pages:u1:recent", "u1"));
        assert!(key_mentions("recentActivity_u1", "u1"));
        assert!(!key_mentions("pages:u10", "u1"));
        assert!(!key_mentions("pages:u1", ""));
    }
}
