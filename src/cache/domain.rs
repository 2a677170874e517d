//! Cache domain: a named store plus fetch-and-cache orchestration.
//!
//! A `CacheDomain` is built once at startup and shared by cloning. It:
//! - Serves hits straight from the store without suspending
//! - Coalesces concurrent misses for a key into one remote fetch
//! - Batches misses across many keys into one remote call
//! - Drops entries when bound invalidation domains fire

use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, OnceLock};

use futures::future::{BoxFuture, FutureExt, Shared};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::entry::{key_mentions, CacheEntry};
use crate::cache::lock::mutex_lock;
use crate::cache::store::{CacheStore, StoreStats};
use crate::config::CacheConfig;
use crate::error::{CacheError, CacheResult, ConfigError};
use crate::invalidation::registry::{InvalidationContext, InvalidationDomain, InvalidationRegistry, Subscription};
use crate::metrics::CacheMetrics;

const SOURCE: &str = "cache::domain";

type Flight<V> = Shared<BoxFuture<'static, CacheResult<V>>>;

/// Called with each fetched value at the moment it is cached.
pub type FillHook<V> = Arc<dyn Fn(&str, &V) + Send + Sync>;

struct InFlight<V> {
    id: u64,
    /// `None` for keys claimed by a batch fetch, which cannot be joined.
    flight: Option<Flight<V>>,
}

struct DomainInner<V> {
    name: String,
    config: CacheConfig,
    store: Mutex<CacheStore<V>>,
    in_flight: Mutex<HashMap<String, InFlight<V>>>,
    next_flight: AtomicU64,
    metrics: Option<CacheMetrics>,
    on_fill: OnceLock<FillHook<V>>,
}

impl<V: Clone + Send + Sync + 'static> DomainInner<V> {
    /// Store a finished flight's value and clear its marker.
    ///
    /// A flight that was detached (its key invalidated or replaced while it
    /// ran) still answers its waiters but is not cached.
    fn complete_flight(&self, key: &str, id: u64, result: &CacheResult<V>) {
        let mut in_flight = mutex_lock(&self.in_flight, SOURCE, "complete_flight");
        let registered = matches!(in_flight.get(key), Some(f) if f.id == id);
        if !registered {
            debug!(domain = %self.name, key, "Detached flight finished; result not cached");
            return;
        }
        in_flight.remove(key);

        match result {
            Ok(value) => {
                self.fill(key, value);
                self.record_fetch("ok");
            }
            Err(CacheError::Timeout { .. }) => self.record_fetch("timeout"),
            Err(CacheError::Aborted { .. }) => self.record_fetch("aborted"),
            Err(_) => self.record_fetch("error"),
        }
    }

    /// Cache a fetched value. Must be called with `in_flight` locked and the
    /// key's marker still registered, so a concurrent invalidation either
    /// sees the entry or has already detached the fetch.
    fn fill(&self, key: &str, value: &V) {
        self.insert(key.to_string(), value.clone());
        if let Some(hook) = self.on_fill.get() {
            hook(key, value);
        }
    }

    fn insert(&self, key: String, value: V) {
        let evicted = mutex_lock(&self.store, SOURCE, "insert").set(key, value);
        if evicted.is_some() {
            if let Some(metrics) = &self.metrics {
                metrics.record_eviction(&self.name);
            }
        }
    }

    fn lookup(&self, key: &str) -> Option<V> {
        let value = mutex_lock(&self.store, SOURCE, "lookup").get(key);
        if let Some(metrics) = &self.metrics {
            metrics.record_lookup(&self.name, value.is_some());
        }
        value
    }

    fn record_fetch(&self, outcome: &str) {
        if let Some(metrics) = &self.metrics {
            metrics.record_fetch(&self.name, outcome);
        }
    }

    fn detach_matching(&self, predicate: impl Fn(&str) -> bool) -> usize {
        let mut in_flight = mutex_lock(&self.in_flight, SOURCE, "detach");
        let before = in_flight.len();
        in_flight.retain(|key, _| !predicate(key));
        before - in_flight.len()
    }
}

/// Keys claimed by one batch fetch. Markers still registered when the guard
/// is dropped (error, timeout, cancelled caller) are released.
struct BatchClaim<V> {
    inner: Arc<DomainInner<V>>,
    ids: HashMap<String, u64>,
}

impl<V: Clone + Send + Sync + 'static> BatchClaim<V> {
    /// Cache the fetched values whose keys were not detached meanwhile.
    fn complete(mut self, fetched: &HashMap<String, V>) {
        let inner = Arc::clone(&self.inner);
        let mut in_flight = mutex_lock(&inner.in_flight, SOURCE, "complete_batch");
        for (key, id) in self.ids.drain() {
            if !matches!(in_flight.get(&key), Some(f) if f.id == id) {
                debug!(domain = %inner.name, key = %key, "Batch key detached; result not cached");
                continue;
            }
            in_flight.remove(&key);
            if let Some(value) = fetched.get(&key) {
                inner.fill(&key, value);
            }
        }
    }
}

impl<V> Drop for BatchClaim<V> {
    fn drop(&mut self) {
        if self.ids.is_empty() {
            return;
        }
        let mut in_flight = mutex_lock(&self.inner.in_flight, SOURCE, "release_batch");
        for (key, id) in self.ids.drain() {
            if matches!(in_flight.get(&key), Some(f) if f.id == id) {
                in_flight.remove(&key);
            }
        }
    }
}

/// A named cache with single-flight fetching. Cheap to clone.
pub struct CacheDomain<V> {
    inner: Arc<DomainInner<V>>,
}

impl<V> Clone for CacheDomain<V> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<V: Clone + Send + Sync + 'static> CacheDomain<V> {
    /// Create a domain, failing fast on invalid tuning.
    pub fn new(name: impl Into<String>, config: CacheConfig) -> Result<Self, ConfigError> {
        Self::build(name.into(), config, None)
    }

    /// Create a domain that reports to `metrics`.
    pub fn with_metrics(
        name: impl Into<String>,
        config: CacheConfig,
        metrics: CacheMetrics,
    ) -> Result<Self, ConfigError> {
        Self::build(name.into(), config, Some(metrics))
    }

    fn build(name: String, config: CacheConfig, metrics: Option<CacheMetrics>) -> Result<Self, ConfigError> {
        let store = CacheStore::new(config.clone())?;
        info!(
            domain = %name,
            max_size = config.max_size,
            hot_threshold = config.hot_threshold,
            warm_threshold = config.warm_threshold,
            "Cache domain created"
        );
        Ok(Self {
            inner: Arc::new(DomainInner {
                name,
                config,
                store: Mutex::new(store),
                in_flight: Mutex::new(HashMap::new()),
                next_flight: AtomicU64::new(0),
                metrics,
                on_fill: OnceLock::new(),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn config(&self) -> &CacheConfig {
        &self.inner.config
    }

    /// Install a hook run whenever a fetched value is cached. Values from
    /// fetches detached by an invalidation never reach it. Only the first
    /// hook installed is kept; returns false if one was already set.
    pub fn on_fill(&self, hook: impl Fn(&str, &V) + Send + Sync + 'static) -> bool {
        self.inner.on_fill.set(Arc::new(hook)).is_ok()
    }

    /// Return the cached value, or fetch it once no matter how many callers ask.
    ///
    /// `fetch` is only invoked when this call starts a new flight; callers
    /// that find a flight already running share its result, success or
    /// failure. Failures are never cached. `fetch` is called while the
    /// in-flight table is locked and should only build the future.
    pub async fn get_or_fetch<F, Fut>(&self, key: &str, fetch: F) -> CacheResult<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = anyhow::Result<V>> + Send + 'static,
    {
        let flight = {
            let mut in_flight = mutex_lock(&self.inner.in_flight, SOURCE, "get_or_fetch");

            if let Some(value) = self.inner.lookup(key) {
                return Ok(value);
            }

            match in_flight.get(key).and_then(|existing| existing.flight.clone()) {
                Some(flight) => {
                    debug!(domain = %self.inner.name, key, "Joining in-flight fetch");
                    self.inner.record_fetch("joined");
                    flight
                }
                None => {
                    // Replacing a batch claim detaches the batch for this key.
                    let id = self.inner.next_flight.fetch_add(1, Ordering::Relaxed);
                    let flight = self.start_flight(key, id, fetch());
                    in_flight.insert(
                        key.to_string(),
                        InFlight {
                            id,
                            flight: Some(flight.clone()),
                        },
                    );
                    flight
                }
            }
        };

        flight.await
    }

    fn start_flight<Fut>(&self, key: &str, id: u64, fetch: Fut) -> Flight<V>
    where
        Fut: Future<Output = anyhow::Result<V>> + Send + 'static,
    {
        debug!(domain = %self.inner.name, key, flight = id, "Starting fetch");

        let inner = Arc::clone(&self.inner);
        let task_key = key.to_string();
        let timeout = self.inner.config.fetch_timeout();

        // The fetch runs on its own task so a cancelled caller cannot strand
        // the other waiters.
        let task: JoinHandle<CacheResult<V>> = tokio::spawn(async move {
            let result = match timeout {
                Some(limit) => match tokio::time::timeout(limit, fetch).await {
                    Ok(result) => result.map_err(CacheError::fetch),
                    Err(_) => Err(CacheError::Timeout {
                        key: task_key.clone(),
                        after_ms: limit.as_millis() as u64,
                    }),
                },
                None => fetch.await.map_err(CacheError::fetch),
            };
            if let Err(e) = &result {
                warn!(domain = %inner.name, key = %task_key, error = %e, "Fetch failed");
            }
            inner.complete_flight(&task_key, id, &result);
            result
        });

        let inner = Arc::clone(&self.inner);
        let waiter_key = key.to_string();
        async move {
            match task.await {
                Ok(result) => result,
                Err(join_error) => {
                    warn!(domain = %inner.name, key = %waiter_key, error = %join_error, "Fetch task aborted");
                    let result = Err(CacheError::Aborted { key: waiter_key.clone() });
                    inner.complete_flight(&waiter_key, id, &result);
                    result
                }
            }
        }
        .boxed()
        .shared()
    }

    /// Fetch many keys, issuing at most one `fetch` call for all misses.
    ///
    /// Keys missing from both the cache and the fetch result are absent from
    /// the returned map. Keys already being fetched by `get_or_fetch` are
    /// joined rather than fetched again. A key invalidated while the batch is
    /// pending is returned to the caller but not cached.
    pub async fn get_or_fetch_batch<I, K, F, Fut>(&self, keys: I, fetch: F) -> CacheResult<HashMap<String, V>>
    where
        I: IntoIterator<Item = K>,
        K: Into<String>,
        F: FnOnce(Vec<String>) -> Fut,
        Fut: Future<Output = anyhow::Result<HashMap<String, V>>>,
    {
        let mut found = HashMap::new();
        let mut joined = Vec::new();
        let mut uncached = Vec::new();
        let mut claim = BatchClaim {
            inner: Arc::clone(&self.inner),
            ids: HashMap::new(),
        };

        {
            let mut in_flight = mutex_lock(&self.inner.in_flight, SOURCE, "get_or_fetch_batch");
            let mut seen = HashSet::new();

            for key in keys {
                let key = key.into();
                if !seen.insert(key.clone()) {
                    continue;
                }
                if let Some(value) = self.inner.lookup(&key) {
                    found.insert(key, value);
                    continue;
                }
                match in_flight.get(&key).and_then(|existing| existing.flight.clone()) {
                    Some(flight) => {
                        self.inner.record_fetch("joined");
                        joined.push((key, flight));
                    }
                    None => {
                        let id = self.inner.next_flight.fetch_add(1, Ordering::Relaxed);
                        in_flight.insert(key.clone(), InFlight { id, flight: None });
                        claim.ids.insert(key.clone(), id);
                        uncached.push(key);
                    }
                }
            }
        }

        if !uncached.is_empty() {
            debug!(
                domain = %self.inner.name,
                cached = found.len(),
                joined = joined.len(),
                uncached = uncached.len(),
                "Fetching batch"
            );

            let requested = uncached.len();
            let batch = fetch(uncached);
            let fetched = match self.inner.config.fetch_timeout() {
                Some(limit) => match tokio::time::timeout(limit, batch).await {
                    Ok(result) => result,
                    Err(_) => {
                        self.inner.record_fetch("timeout");
                        return Err(CacheError::Timeout {
                            key: format!("batch of {requested}"),
                            after_ms: limit.as_millis() as u64,
                        });
                    }
                },
                None => batch.await,
            };

            let mut fetched = match fetched {
                Ok(values) => values,
                Err(e) => {
                    self.inner.record_fetch("error");
                    warn!(domain = %self.inner.name, error = %e, "Batch fetch failed");
                    return Err(CacheError::fetch(e));
                }
            };
            self.inner.record_fetch("ok");

            fetched.retain(|key, _| claim.ids.contains_key(key));
            claim.complete(&fetched);
            found.extend(fetched);
        }

        for (key, flight) in joined {
            let value = flight.await?;
            found.insert(key, value);
        }

        Ok(found)
    }

    /// Cache lookup without fetching.
    pub fn get(&self, key: &str) -> Option<V> {
        self.inner.lookup(key)
    }

    /// Insert or overwrite a value directly.
    pub fn set(&self, key: impl Into<String>, value: V) {
        self.inner.insert(key.into(), value);
    }

    /// Drop a key and detach any fetch in flight for it.
    pub fn delete(&self, key: &str) -> bool {
        self.inner.detach_matching(|k| k == key);
        mutex_lock(&self.inner.store, SOURCE, "delete").delete(key)
    }

    /// Drop every entry and detach every fetch in flight.
    pub fn clear(&self) {
        self.inner.detach_matching(|_| true);
        mutex_lock(&self.inner.store, SOURCE, "clear").clear();
    }

    /// Drop every key mentioning `id`. Returns how many entries were removed.
    pub fn remove_mentioning(&self, id: &str) -> usize {
        self.inner.detach_matching(|k| key_mentions(k, id));
        mutex_lock(&self.inner.store, SOURCE, "remove_mentioning").remove_matching(|k| key_mentions(k, id))
    }

    /// Drop all expired entries now.
    pub fn sweep_expired(&self) -> usize {
        mutex_lock(&self.inner.store, SOURCE, "sweep").sweep_expired()
    }

    pub fn stats(&self) -> StoreStats {
        mutex_lock(&self.inner.store, SOURCE, "stats").stats()
    }

    pub fn len(&self) -> usize {
        mutex_lock(&self.inner.store, SOURCE, "len").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of keys with a fetch currently in flight.
    pub fn in_flight(&self) -> usize {
        mutex_lock(&self.inner.in_flight, SOURCE, "in_flight").len()
    }

    /// Inspect an entry without recording an access.
    pub fn peek(&self, key: &str) -> Option<CacheEntry<V>> {
        mutex_lock(&self.inner.store, SOURCE, "peek").peek(key).cloned()
    }

    /// Drop entries from this domain whenever `domain` is invalidated.
    ///
    /// A context naming a user or page removes only keys mentioning it; an
    /// empty context clears the whole cache.
    pub fn bind(&self, registry: &InvalidationRegistry, domain: InvalidationDomain) -> Subscription {
        let cache = self.clone();
        registry.subscribe(domain, move |context: &InvalidationContext| {
            if context.is_empty() {
                cache.clear();
                debug!(domain = %cache.name(), "Cleared on invalidation");
            } else {
                let removed: usize = context.identifiers().map(|id| cache.remove_mentioning(id)).sum();
                debug!(domain = %cache.name(), removed, "Removed entries on invalidation");
            }
            Ok(())
        })
    }

    /// Spawn the periodic expiry sweep, if one is configured.
    ///
    /// The task holds only a weak reference and stops once every clone of
    /// the domain is dropped.
    pub fn spawn_sweeper(&self) -> Option<JoinHandle<()>> {
        let period = self.inner.config.sweep_interval()?;
        let weak = Arc::downgrade(&self.inner);
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let removed = mutex_lock(&inner.store, SOURCE, "sweeper").sweep_expired();
                if removed > 0 {
                    debug!(domain = %inner.name, removed, "Swept expired entries");
                }
            }
        }))
    }
}

impl<V> std::fmt::Debug for CacheDomain<V> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheDomain")
            .field("name", &self.inner.name)
            .field("config", &self.inner.config)
            .finish()
    }
}
