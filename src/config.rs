//! Runtime configuration for wewrite-cache.
//!
//! Configuration is loaded from a JSON file or constructed programmatically.
//! Every cache domain carries its own tuning (capacity, tier thresholds,
//! per-tier TTLs); missing fields fall back to the documented defaults.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use serde::{Deserialize, Serialize};

use crate::error::ConfigError;
use crate::invalidation::registry::InvalidationDomain;

/// Command-line arguments.
#[derive(Parser, Debug, Clone)]
#[command(name = "wewrite-cache", about = "Read-through tiered cache for the WeWrite API")]
pub struct Cli {
    /// Path to configuration file (JSON).
    #[arg(short, long, default_value = "config.json")]
    pub config: PathBuf,

    /// HTTP listen address (overrides the config file).
    #[arg(long)]
    pub listen: Option<String>,

    /// Upstream API base URL (overrides the config file).
    #[arg(long)]
    pub upstream: Option<String>,

    /// Enable verbose logging.
    #[arg(short, long)]
    pub verbose: bool,

    /// Emit logs as JSON lines.
    #[arg(long)]
    pub log_json: bool,
}

/// Top-level configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Server configuration.
    pub server: ServerConfig,

    /// Upstream API the read-through domains fetch from.
    pub upstream: UpstreamConfig,

    /// Cache domains by name.
    pub domains: BTreeMap<String, DomainConfig>,

    /// Invalidation side effects.
    pub invalidation: InvalidationConfig,
}

impl Default for Config {
    fn default() -> Self {
        let mut domains = BTreeMap::new();
        domains.insert(
            "users".to_string(),
            DomainConfig {
                cache: CacheConfig::default(),
                item_path: "/api/users/{id}".to_string(),
                batch_path: Some("/api/users/batch".to_string()),
                invalidated_by: vec![InvalidationDomain::UserProfile],
            },
        );
        domains.insert(
            "pages".to_string(),
            DomainConfig {
                cache: CacheConfig {
                    max_size: 500,
                    ..CacheConfig::default()
                },
                item_path: "/api/pages/{id}".to_string(),
                batch_path: None,
                invalidated_by: vec![InvalidationDomain::UserPages, InvalidationDomain::PageContent],
            },
        );

        Self {
            server: ServerConfig::default(),
            upstream: UpstreamConfig::default(),
            domains,
            invalidation: InvalidationConfig::default(),
        }
    }
}

/// HTTP server settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Listen address (e.g. "0.0.0.0:8080").
    pub listen: String,

    /// Request timeout in seconds.
    pub request_timeout_secs: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: "0.0.0.0:8080".to_string(),
            request_timeout_secs: 60,
        }
    }
}

/// Upstream HTTP API settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct UpstreamConfig {
    /// Base URL, e.g. "http://localhost:3000".
    pub base_url: String,

    /// Per-request timeout in milliseconds.
    pub request_timeout_ms: u64,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:3000".to_string(),
            request_timeout_ms: 10_000,
        }
    }
}

/// A named cache domain served over HTTP.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DomainConfig {
    /// Cache tuning.
    #[serde(default)]
    pub cache: CacheConfig,

    /// Upstream path for a single item; `{id}` is replaced by the key.
    pub item_path: String,

    /// Upstream path accepting `{"ids": [...]}` and answering `{id: value}`.
    #[serde(default)]
    pub batch_path: Option<String>,

    /// Invalidation domains that drop entries from this cache.
    #[serde(default)]
    pub invalidated_by: Vec<InvalidationDomain>,
}

/// Tuning for a single cache store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Maximum number of entries held at once.
    pub max_size: usize,

    /// Access count at which an entry becomes hot.
    pub hot_threshold: u64,

    /// Access count at which an entry becomes warm.
    pub warm_threshold: u64,

    /// TTL for hot entries in milliseconds.
    pub ttl_hot_ms: u64,

    /// TTL for warm entries in milliseconds.
    pub ttl_warm_ms: u64,

    /// TTL for cold entries in milliseconds.
    pub ttl_cold_ms: u64,

    /// Period of the background expiry sweep (0 = disabled).
    pub sweep_interval_ms: u64,

    /// Upper bound on a single in-flight fetch (0 = unbounded).
    pub fetch_timeout_ms: u64,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_size: 1000,
            hot_threshold: 3,
            warm_threshold: 2,
            ttl_hot_ms: 30 * 60 * 1000,
            ttl_warm_ms: 10 * 60 * 1000,
            ttl_cold_ms: 2 * 60 * 1000,
            sweep_interval_ms: 60 * 1000,
            fetch_timeout_ms: 30 * 1000,
        }
    }
}

impl CacheConfig {
    /// Reject tuning values that would make the store misbehave.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_size == 0 {
            return Err(ConfigError::ZeroMaxSize);
        }
        if self.warm_threshold == 0 {
            return Err(ConfigError::ZeroThreshold {
                name: "warm_threshold",
            });
        }
        if self.hot_threshold == 0 {
            return Err(ConfigError::ZeroThreshold {
                name: "hot_threshold",
            });
        }
        if self.hot_threshold < self.warm_threshold {
            return Err(ConfigError::ThresholdOrder {
                hot: self.hot_threshold,
                warm: self.warm_threshold,
            });
        }
        for (name, ttl) in [
            ("ttl_hot_ms", self.ttl_hot_ms),
            ("ttl_warm_ms", self.ttl_warm_ms),
            ("ttl_cold_ms", self.ttl_cold_ms),
        ] {
            if ttl == 0 {
                return Err(ConfigError::ZeroTtl { name });
            }
        }
        if !(self.ttl_hot_ms >= self.ttl_warm_ms && self.ttl_warm_ms >= self.ttl_cold_ms) {
            return Err(ConfigError::TtlOrder {
                hot: self.ttl_hot_ms,
                warm: self.ttl_warm_ms,
                cold: self.ttl_cold_ms,
            });
        }
        Ok(())
    }

    /// Sweep period, if the background sweep is enabled.
    pub fn sweep_interval(&self) -> Option<Duration> {
        (self.sweep_interval_ms > 0).then(|| Duration::from_millis(self.sweep_interval_ms))
    }

    /// Fetch bound, if one is configured.
    pub fn fetch_timeout(&self) -> Option<Duration> {
        (self.fetch_timeout_ms > 0).then(|| Duration::from_millis(self.fetch_timeout_ms))
    }
}

/// Invalidation side-effect settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct InvalidationConfig {
    /// JSON file holding locally persisted copies (None = in-memory only).
    pub persisted_path: Option<PathBuf>,

    /// Domains whose invalidation also purges persisted copies.
    pub purge_domains: Vec<InvalidationDomain>,
}

impl Default for InvalidationConfig {
    fn default() -> Self {
        Self {
            persisted_path: None,
            purge_domains: vec![InvalidationDomain::UserPages, InvalidationDomain::RecentActivity],
        }
    }
}

impl Config {
    /// Load configuration from a JSON file, falling back to defaults for missing fields.
    pub fn load(path: &std::path::Path) -> anyhow::Result<Self> {
        let config = if path.exists() {
            let data = std::fs::read_to_string(path)?;
            serde_json::from_str::<Config>(&data)?
        } else {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            Config::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Validate every domain's tuning and upstream paths.
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, domain) in &self.domains {
            domain.cache.validate()?;
            if !domain.item_path.contains("{id}") {
                return Err(ConfigError::MissingIdPlaceholder {
                    domain: name.clone(),
                });
            }
        }
        Ok(())
    }
}
