//! wewrite-cache: tiered in-memory caching for the WeWrite API layer.
//!
//! Entries are bucketed into hot/warm/cold tiers by access frequency, each
//! tier with its own TTL. Misses are fetched once per key no matter how many
//! callers are waiting, and mutations elsewhere fan out through an
//! invalidation registry.

pub mod cache;
pub mod config;
pub mod error;
pub mod invalidation;
pub mod metrics;
pub mod server;
pub mod upstream;
