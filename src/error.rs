//! Error types shared across the cache, invalidation and server layers.

use std::sync::Arc;

use thiserror::Error;

/// Invalid cache-domain tuning, detected when the domain is constructed.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("max_size must be greater than zero")]
    ZeroMaxSize,

    #[error("{name} must be greater than zero")]
    ZeroThreshold { name: &'static str },

    #[error("hot_threshold ({hot}) must not be below warm_threshold ({warm})")]
    ThresholdOrder { hot: u64, warm: u64 },

    #[error("{name} must be greater than zero")]
    ZeroTtl { name: &'static str },

    #[error("tier TTLs must satisfy hot >= warm >= cold (got {hot}ms, {warm}ms, {cold}ms)")]
    TtlOrder { hot: u64, warm: u64, cold: u64 },

    #[error("domain {domain:?}: item_path must contain an {{id}} placeholder")]
    MissingIdPlaceholder { domain: String },
}

/// Errors surfaced by [`CacheDomain`](crate::cache::domain::CacheDomain).
///
/// Cloneable so a single flight can hand the same failure to every waiter.
#[derive(Error, Debug, Clone)]
pub enum CacheError {
    #[error("fetch failed: {0:#}")]
    Fetch(Arc<anyhow::Error>),

    #[error("fetch for key {key:?} timed out after {after_ms}ms")]
    Timeout { key: String, after_ms: u64 },

    #[error("fetch for key {key:?} was aborted before completing")]
    Aborted { key: String },

    #[error("invalid cache configuration: {0}")]
    Config(#[from] ConfigError),
}

impl CacheError {
    /// Wrap an arbitrary fetch failure.
    pub fn fetch(err: impl Into<anyhow::Error>) -> Self {
        CacheError::Fetch(Arc::new(err.into()))
    }
}

/// Failures of a persisted local store.
#[derive(Error, Debug)]
pub enum PersistError {
    #[error("local store I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("local store is not valid JSON: {0}")]
    Json(#[from] serde_json::Error),
}

pub type CacheResult<T> = Result<T, CacheError>;
