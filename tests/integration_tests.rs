//! End-to-end tests: cache domains, single-flight fetching, invalidation
//! broadcast and persisted-copy purging working together.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::join_all;
use serde_json::json;

use wewrite_cache::cache::domain::CacheDomain;
use wewrite_cache::cache::entry::cache_key;
use wewrite_cache::config::CacheConfig;
use wewrite_cache::error::CacheError;
use wewrite_cache::invalidation::persisted::{LocalCopyWorker, LocalStore, MemoryLocalStore};
use wewrite_cache::invalidation::registry::{InvalidationContext, InvalidationDomain, InvalidationRegistry};

fn domain<V: Clone + Send + Sync + 'static>(name: &str) -> CacheDomain<V> {
    CacheDomain::new(name, CacheConfig::default()).unwrap()
}

#[tokio::test]
async fn test_concurrent_misses_share_one_fetch() {
    let cache: CacheDomain<String> = domain("users");
    let calls = Arc::new(AtomicUsize::new(0));

    let requests = (0..10).map(|_| {
        let calls = Arc::clone(&calls);
        let cache = cache.clone();
        async move {
            cache
                .get_or_fetch("profile:u1", move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(20)).await;
                    Ok::<_, anyhow::Error>("alice".to_string())
                })
                .await
        }
    });

    let results = join_all(requests).await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    for result in results {
        assert_eq!(result.unwrap(), "alice");
    }
    assert_eq!(cache.get("profile:u1").as_deref(), Some("alice"));
    assert_eq!(cache.in_flight(), 0);
}

#[tokio::test]
async fn test_concurrent_waiters_share_failure() {
    let cache: CacheDomain<u32> = domain("users");
    let calls = Arc::new(AtomicUsize::new(0));

    let requests = (0..4).map(|_| {
        let calls = Arc::clone(&calls);
        let cache = cache.clone();
        async move {
            cache
                .get_or_fetch("profile:u9", move || async move {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    Err::<u32, _>(anyhow::anyhow!("upstream unavailable"))
                })
                .await
        }
    });

    let results = join_all(requests).await;

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(results.iter().all(|r| matches!(r, Err(CacheError::Fetch(_)))));
    assert!(cache.get("profile:u9").is_none());

    // The next caller retries.
    let value = cache
        .get_or_fetch("profile:u9", || async { Ok::<_, anyhow::Error>(9) })
        .await
        .unwrap();
    assert_eq!(value, 9);
}

#[tokio::test]
async fn test_batch_fetches_only_misses() {
    let cache: CacheDomain<String> = domain("users");
    cache.set("a", "A".to_string());

    let requested = Arc::new(Mutex::new(Vec::new()));
    let calls = Arc::new(AtomicUsize::new(0));

    let seen = Arc::clone(&requested);
    let counter = Arc::clone(&calls);
    let result = cache
        .get_or_fetch_batch(["a", "b", "c"], move |keys| async move {
            counter.fetch_add(1, Ordering::SeqCst);
            seen.lock().unwrap().extend(keys.iter().cloned());
            Ok::<HashMap<String, String>, anyhow::Error>(
                keys.into_iter().map(|k| (k.clone(), k.to_uppercase())).collect(),
            )
        })
        .await
        .unwrap();

    assert_eq!(calls.load(Ordering::SeqCst), 1);
    let mut fetched = requested.lock().unwrap().clone();
    fetched.sort();
    assert_eq!(fetched, vec!["b".to_string(), "c".to_string()]);

    assert_eq!(result.len(), 3);
    assert_eq!(result["a"], "A");
    assert_eq!(result["b"], "B");
    assert_eq!(result["c"], "C");
    assert_eq!(cache.get("c").as_deref(), Some("C"));
}

#[tokio::test]
async fn test_batch_missing_keys_are_absent() {
    let cache: CacheDomain<u32> = domain("pages");

    let result = cache
        .get_or_fetch_batch(["p1", "p2"], |_keys| async {
            Ok::<HashMap<String, u32>, anyhow::Error>(HashMap::from([("p1".to_string(), 1)]))
        })
        .await
        .unwrap();

    assert_eq!(result.len(), 1);
    assert!(!result.contains_key("p2"));
    assert!(cache.get("p2").is_none());
}

#[tokio::test]
async fn test_batch_failure_propagates_and_caches_nothing() {
    let cache: CacheDomain<u32> = domain("pages");
    cache.set("p1", 1);

    let result = cache
        .get_or_fetch_batch(["p1", "p2", "p3"], |_keys| async {
            Err::<HashMap<String, u32>, _>(anyhow::anyhow!("batch endpoint down"))
        })
        .await;

    assert!(matches!(result, Err(CacheError::Fetch(_))));
    assert!(cache.get("p2").is_none());
    assert!(cache.get("p3").is_none());
    assert_eq!(cache.len(), 1);
    assert_eq!(cache.in_flight(), 0);
}

#[tokio::test(start_paused = true)]
async fn test_batch_timeout_releases_keys() {
    let cache: CacheDomain<u32> = CacheDomain::new(
        "pages",
        CacheConfig {
            fetch_timeout_ms: 250,
            ..Default::default()
        },
    )
    .unwrap();

    let result = cache
        .get_or_fetch_batch(["p1", "p2"], |keys| async move {
            tokio::time::sleep(Duration::from_secs(30)).await;
            Ok::<HashMap<String, u32>, anyhow::Error>(keys.into_iter().map(|k| (k, 1)).collect())
        })
        .await;

    assert!(matches!(result, Err(CacheError::Timeout { after_ms: 250, .. })));
    assert!(cache.is_empty());
    assert_eq!(cache.in_flight(), 0);

    // Released keys can be fetched again.
    let value = cache
        .get_or_fetch("p1", || async { Ok::<_, anyhow::Error>(7) })
        .await
        .unwrap();
    assert_eq!(value, 7);
}

#[tokio::test]
async fn test_batch_duplicate_keys_fetched_once() {
    let cache: CacheDomain<String> = domain("users");
    let requested = Arc::new(Mutex::new(Vec::new()));

    let seen = Arc::clone(&requested);
    let result = cache
        .get_or_fetch_batch(["u1", "u2", "u1", "u2", "u1"], move |keys| async move {
            seen.lock().unwrap().extend(keys.iter().cloned());
            Ok::<HashMap<String, String>, anyhow::Error>(
                keys.into_iter().map(|k| (k.clone(), k.to_uppercase())).collect(),
            )
        })
        .await
        .unwrap();

    let mut fetched = requested.lock().unwrap().clone();
    fetched.sort();
    assert_eq!(fetched, vec!["u1".to_string(), "u2".to_string()]);
    assert_eq!(result.len(), 2);
    assert_eq!(result["u1"], "U1");
}

#[tokio::test]
async fn test_batch_result_for_invalidated_key_not_cached() {
    let registry = InvalidationRegistry::new();
    let pages: CacheDomain<String> = domain("pages");
    let _subscription = pages.bind(&registry, InvalidationDomain::UserPages);
    let (release_tx, release_rx) = tokio::sync::oneshot::channel::<()>();

    let batch = {
        let pages = pages.clone();
        tokio::spawn(async move {
            pages
                .get_or_fetch_batch(["pages:u1"], |keys| async move {
                    let _ = release_rx.await;
                    Ok::<HashMap<String, String>, anyhow::Error>(
                        keys.into_iter().map(|k| (k, "pre-mutation".to_string())).collect(),
                    )
                })
                .await
        })
    };
    while pages.in_flight() == 0 {
        tokio::task::yield_now().await;
    }

    registry.invalidate(InvalidationDomain::UserPages, &InvalidationContext::for_user("u1"));
    release_tx.send(()).unwrap();

    let values = batch.await.unwrap().unwrap();
    assert_eq!(values["pages:u1"], "pre-mutation");
    assert!(pages.get("pages:u1").is_none());
}

#[test]
fn test_subscribers_all_notified_despite_failure() {
    let registry = InvalidationRegistry::new();
    let first = Arc::new(AtomicUsize::new(0));
    let third = Arc::new(AtomicUsize::new(0));

    let counter = Arc::clone(&first);
    let _a = registry.subscribe(InvalidationDomain::UserPages, move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });
    let _b = registry.subscribe(InvalidationDomain::UserPages, |_| -> anyhow::Result<()> {
        Err(anyhow::anyhow!("subscriber broke"))
    });
    let counter = Arc::clone(&third);
    let _c = registry.subscribe(InvalidationDomain::UserPages, move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
        Ok(())
    });

    let report = registry.invalidate(InvalidationDomain::UserPages, &InvalidationContext::for_user("u1"));

    assert_eq!(first.load(Ordering::SeqCst), 1);
    assert_eq!(third.load(Ordering::SeqCst), 1);
    assert_eq!(report.notified, 2);
    assert_eq!(report.failed, 1);
}

#[test]
fn test_invalidate_without_subscribers_is_noop() {
    let registry = InvalidationRegistry::new();
    let report = registry.invalidate("search", &InvalidationContext::none());

    assert_eq!(report.notified, 0);
    assert_eq!(report.failed, 0);
    assert!(!report.purge_scheduled);
}

#[test]
fn test_profile_update_drops_cached_profile() {
    let registry = InvalidationRegistry::new();
    let users: CacheDomain<String> = domain("users");
    let _subscription = users.bind(&registry, InvalidationDomain::UserProfile);

    users.set(cache_key("profile", "u1"), "alice".to_string());
    users.set(cache_key("profile", "u2"), "bob".to_string());

    registry.invalidate(InvalidationDomain::UserProfile, &InvalidationContext::for_user("u1"));

    assert!(users.get("profile:u1").is_none());
    assert_eq!(users.get("profile:u2").as_deref(), Some("bob"));
}

#[tokio::test]
async fn test_invalidation_purges_persisted_copies() {
    let store = Arc::new(MemoryLocalStore::new());
    store.put("recentActivity_u1", json!({"items": [1, 2]})).await.unwrap();
    store.put("pages:u1:drafts", json!([3])).await.unwrap();
    store.put("pages:u2:drafts", json!([4])).await.unwrap();

    let (purger, _task) = LocalCopyWorker::spawn(store.clone());
    let registry = InvalidationRegistry::builder()
        .purger(purger.clone(), [InvalidationDomain::UserPages, InvalidationDomain::RecentActivity])
        .build();

    let report = registry.invalidate(InvalidationDomain::UserPages, &InvalidationContext::for_user("u1"));
    assert!(report.purge_scheduled);

    purger.flush().await;
    assert_eq!(store.keys().await.unwrap(), vec!["pages:u2:drafts".to_string()]);
}

#[tokio::test]
async fn test_non_purge_domain_leaves_persisted_copies() {
    let store = Arc::new(MemoryLocalStore::new());
    store.put("pages:u1:drafts", json!([3])).await.unwrap();

    let (purger, _task) = LocalCopyWorker::spawn(store.clone());
    let registry = InvalidationRegistry::builder()
        .purger(purger.clone(), [InvalidationDomain::UserPages])
        .build();

    let report = registry.invalidate(InvalidationDomain::Search, &InvalidationContext::for_user("u1"));
    assert!(!report.purge_scheduled);

    purger.flush().await;
    assert_eq!(store.keys().await.unwrap().len(), 1);
}
