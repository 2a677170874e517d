//! Tiered in-memory cache.
//!
//! This module contains the core cache data structures and algorithms:
//! - [`entry`]: CacheEntry, Tier definitions and key helpers
//! - [`evictor`]: Eviction policy (frequency weighted by recency)
//! - [`store`]: Bounded key-value store with lazy expiry
//! - [`domain`]: Named cache with single-flight and batch fetching

pub mod domain;
pub mod entry;
pub mod evictor;
pub(crate) mod lock;
pub mod store;
