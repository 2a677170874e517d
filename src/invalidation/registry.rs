//! Invalidation broadcaster.
//!
//! Producers call [`InvalidationRegistry::invalidate`] after a mutation;
//! consumers register callbacks per [`InvalidationDomain`]. The two sides
//! never reference each other directly.

use std::collections::{HashMap, HashSet};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::cache::lock::mutex_lock;
use crate::invalidation::persisted::{LocalCopyHandle, PurgeRequest};
use crate::metrics::CacheMetrics;

const SOURCE: &str = "invalidation::registry";

/// A logical grouping of cached data that is refreshed as a unit.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum InvalidationDomain {
    /// Page lists owned by a user.
    UserPages,
    /// Activity feeds.
    RecentActivity,
    /// Content of a single page.
    PageContent,
    /// User profile records.
    UserProfile,
    /// Search results.
    Search,
    /// Any domain not listed above.
    Other(String),
}

impl InvalidationDomain {
    pub fn as_str(&self) -> &str {
        match self {
            InvalidationDomain::UserPages => "userPages",
            InvalidationDomain::RecentActivity => "recentActivity",
            InvalidationDomain::PageContent => "pageContent",
            InvalidationDomain::UserProfile => "userProfile",
            InvalidationDomain::Search => "search",
            InvalidationDomain::Other(name) => name,
        }
    }
}

impl From<&str> for InvalidationDomain {
    fn from(name: &str) -> Self {
        match name {
            "userPages" => InvalidationDomain::UserPages,
            "recentActivity" => InvalidationDomain::RecentActivity,
            "pageContent" => InvalidationDomain::PageContent,
            "userProfile" => InvalidationDomain::UserProfile,
            "search" => InvalidationDomain::Search,
            other => InvalidationDomain::Other(other.to_string()),
        }
    }
}

impl From<String> for InvalidationDomain {
    fn from(name: String) -> Self {
        InvalidationDomain::from(name.as_str())
    }
}

impl From<InvalidationDomain> for String {
    fn from(domain: InvalidationDomain) -> Self {
        domain.as_str().to_string()
    }
}

impl std::fmt::Display for InvalidationDomain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What changed, passed to every subscriber.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvalidationContext {
    #[serde(default, alias = "userId", skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, alias = "pageId", skip_serializing_if = "Option::is_none")]
    pub page_id: Option<String>,
}

impl InvalidationContext {
    /// No specific subject: subscribers should refresh everything.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn for_user(user_id: impl Into<String>) -> Self {
        Self {
            user_id: Some(user_id.into()),
            page_id: None,
        }
    }

    pub fn for_page(page_id: impl Into<String>) -> Self {
        Self {
            user_id: None,
            page_id: Some(page_id.into()),
        }
    }

    /// Identifiers carried by this context.
    pub fn identifiers(&self) -> impl Iterator<Item = &str> {
        self.user_id
            .as_deref()
            .into_iter()
            .chain(self.page_id.as_deref())
            .filter(|id| !id.is_empty())
    }

    /// Whether the context names no subject at all.
    pub fn is_empty(&self) -> bool {
        self.identifiers().next().is_none()
    }
}

/// Subscriber callback. Returning an error marks the notification failed.
pub type InvalidationCallback = Arc<dyn Fn(&InvalidationContext) -> anyhow::Result<()> + Send + Sync>;

struct Subscriber {
    id: u64,
    active: Arc<AtomicBool>,
    callback: InvalidationCallback,
}

struct RegistryInner {
    subscribers: Mutex<HashMap<InvalidationDomain, Vec<Subscriber>>>,
    next_id: AtomicU64,
    purger: Option<LocalCopyHandle>,
    purge_domains: HashSet<InvalidationDomain>,
    metrics: Option<CacheMetrics>,
}

impl RegistryInner {
    fn remove(&self, domain: &InvalidationDomain, id: u64) -> bool {
        let mut subscribers = mutex_lock(&self.subscribers, SOURCE, "unsubscribe");
        let Some(list) = subscribers.get_mut(domain) else {
            return false;
        };
        let before = list.len();
        list.retain(|s| s.id != id);
        let removed = list.len() != before;
        if list.is_empty() {
            subscribers.remove(domain);
        }
        removed
    }
}

/// Handle returned by [`InvalidationRegistry::subscribe`].
///
/// Dropping the handle keeps the subscription alive; call
/// [`Subscription::unsubscribe`] to remove it.
pub struct Subscription {
    id: u64,
    domain: InvalidationDomain,
    active: Arc<AtomicBool>,
    registry: Weak<RegistryInner>,
}

impl Subscription {
    /// Remove the callback. Returns whether it was still registered.
    pub fn unsubscribe(self) -> bool {
        self.active.store(false, Ordering::SeqCst);
        match self.registry.upgrade() {
            Some(inner) => inner.remove(&self.domain, self.id),
            None => false,
        }
    }

    pub fn domain(&self) -> &InvalidationDomain {
        &self.domain
    }
}

impl std::fmt::Debug for Subscription {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription")
            .field("id", &self.id)
            .field("domain", &self.domain)
            .finish()
    }
}

/// Outcome of one [`InvalidationRegistry::invalidate`] call.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct InvalidationReport {
    /// Callbacks that completed.
    pub notified: usize,
    /// Callbacks that returned an error or panicked.
    pub failed: usize,
    /// Whether a persisted-copy purge was queued.
    pub purge_scheduled: bool,
}

/// Process-wide subscriber registry, shared by cloning.
#[derive(Clone)]
pub struct InvalidationRegistry {
    inner: Arc<RegistryInner>,
}

impl Default for InvalidationRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl InvalidationRegistry {
    /// A registry with no persisted-copy side effects.
    pub fn new() -> Self {
        Self::builder().build()
    }

    pub fn builder() -> RegistryBuilder {
        RegistryBuilder::default()
    }

    /// Register a callback for `domain`.
    pub fn subscribe<F>(&self, domain: impl Into<InvalidationDomain>, callback: F) -> Subscription
    where
        F: Fn(&InvalidationContext) -> anyhow::Result<()> + Send + Sync + 'static,
    {
        let domain = domain.into();
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let active = Arc::new(AtomicBool::new(true));

        mutex_lock(&self.inner.subscribers, SOURCE, "subscribe")
            .entry(domain.clone())
            .or_default()
            .push(Subscriber {
                id,
                active: Arc::clone(&active),
                callback: Arc::new(callback),
            });

        debug!(domain = %domain, subscription = id, "Subscribed to invalidations");

        Subscription {
            id,
            domain,
            active,
            registry: Arc::downgrade(&self.inner),
        }
    }

    /// Notify every subscriber of `domain`.
    ///
    /// Callbacks run synchronously on the caller's thread. A failing callback
    /// is logged and skipped. For purge-enabled domains a deletion of
    /// persisted copies mentioning the context's identifiers is queued and
    /// completes in the background.
    pub fn invalidate(
        &self,
        domain: impl Into<InvalidationDomain>,
        context: &InvalidationContext,
    ) -> InvalidationReport {
        let domain = domain.into();

        // Snapshot so callbacks may subscribe or unsubscribe without deadlocking.
        let snapshot: Vec<(u64, Arc<AtomicBool>, InvalidationCallback)> =
            mutex_lock(&self.inner.subscribers, SOURCE, "invalidate")
                .get(&domain)
                .map(|list| {
                    list.iter()
                        .map(|s| (s.id, Arc::clone(&s.active), Arc::clone(&s.callback)))
                        .collect()
                })
                .unwrap_or_default();

        let mut report = InvalidationReport::default();

        for (id, active, callback) in snapshot {
            if !active.load(Ordering::SeqCst) {
                continue;
            }
            match catch_unwind(AssertUnwindSafe(|| callback(context))) {
                Ok(Ok(())) => report.notified += 1,
                Ok(Err(e)) => {
                    report.failed += 1;
                    warn!(domain = %domain, subscription = id, error = %e, "Invalidation callback failed");
                }
                Err(_) => {
                    report.failed += 1;
                    warn!(domain = %domain, subscription = id, "Invalidation callback panicked");
                }
            }
        }

        if self.inner.purge_domains.contains(&domain) {
            if let Some(purger) = &self.inner.purger {
                for fragment in context.identifiers() {
                    report.purge_scheduled |= purger.schedule(PurgeRequest {
                        domain: domain.clone(),
                        fragment: fragment.to_string(),
                    });
                }
            }
        }

        if let Some(metrics) = &self.inner.metrics {
            metrics.record_invalidation(domain.as_str(), report.failed);
        }

        info!(
            domain = %domain,
            user_id = context.user_id.as_deref().unwrap_or(""),
            page_id = context.page_id.as_deref().unwrap_or(""),
            notified = report.notified,
            failed = report.failed,
            purge_scheduled = report.purge_scheduled,
            "Invalidation broadcast"
        );

        report
    }

    /// Number of live subscribers for `domain`.
    pub fn subscriber_count(&self, domain: &InvalidationDomain) -> usize {
        mutex_lock(&self.inner.subscribers, SOURCE, "subscriber_count")
            .get(domain)
            .map_or(0, Vec::len)
    }
}

/// Configures the side effects of an [`InvalidationRegistry`].
#[derive(Default)]
pub struct RegistryBuilder {
    purger: Option<LocalCopyHandle>,
    purge_domains: HashSet<InvalidationDomain>,
    metrics: Option<CacheMetrics>,
}

impl RegistryBuilder {
    /// Purge persisted copies through `handle` when any of `domains` is invalidated.
    pub fn purger(
        mut self,
        handle: LocalCopyHandle,
        domains: impl IntoIterator<Item = InvalidationDomain>,
    ) -> Self {
        self.purger = Some(handle);
        self.purge_domains.extend(domains);
        self
    }

    pub fn metrics(mut self, metrics: CacheMetrics) -> Self {
        self.metrics = Some(metrics);
        self
    }

    pub fn build(self) -> InvalidationRegistry {
        InvalidationRegistry {
            inner: Arc::new(RegistryInner {
                subscribers: Mutex::new(HashMap::new()),
                next_id: AtomicU64::new(0),
                purger: self.purger,
                purge_domains: self.purge_domains,
                metrics: self.metrics,
            }),
        }
    }
}
