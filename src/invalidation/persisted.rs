//! Locally persisted copies and the background worker that maintains them.
//!
//! Fetched values may be written to a [`LocalStore`] so they survive a
//! restart or an upstream outage. Invalidating a purge-enabled domain queues
//! a [`PurgeRequest`]; the worker drains the queue in order and deletes every
//! persisted key that mentions the request's identifier. Writes go through
//! the same queue, so a purge always lands after any write queued before it.

use std::collections::BTreeMap;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{mpsc, oneshot, Mutex};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::entry::key_mentions;
use crate::error::PersistError;
use crate::invalidation::registry::InvalidationDomain;

/// Key-value storage for persisted copies.
#[async_trait]
pub trait LocalStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Value>, PersistError>;

    async fn put(&self, key: &str, value: Value) -> Result<(), PersistError>;

    /// Delete every key mentioning `fragment`. Returns how many were removed.
    async fn remove_matching(&self, fragment: &str) -> Result<usize, PersistError>;

    async fn keys(&self) -> Result<Vec<String>, PersistError>;
}

/// In-memory store, used when no path is configured and in tests.
#[derive(Debug, Default)]
pub struct MemoryLocalStore {
    entries: Mutex<BTreeMap<String, Value>>,
}

impl MemoryLocalStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl LocalStore for MemoryLocalStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, PersistError> {
        Ok(self.entries.lock().await.get(key).cloned())
    }

    async fn put(&self, key: &str, value: Value) -> Result<(), PersistError> {
        self.entries.lock().await.insert(key.to_string(), value);
        Ok(())
    }

    async fn remove_matching(&self, fragment: &str) -> Result<usize, PersistError> {
        let mut entries = self.entries.lock().await;
        let before = entries.len();
        entries.retain(|key, _| !key_mentions(key, fragment));
        Ok(before - entries.len())
    }

    async fn keys(&self) -> Result<Vec<String>, PersistError> {
        Ok(self.entries.lock().await.keys().cloned().collect())
    }
}

/// A single JSON object on disk, rewritten on every mutation.
#[derive(Debug)]
pub struct JsonFileStore {
    path: PathBuf,
    // Serializes read-modify-write cycles.
    lock: Mutex<()>,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            lock: Mutex::new(()),
        }
    }

    async fn load(&self) -> Result<BTreeMap<String, Value>, PersistError> {
        match tokio::fs::read(&self.path).await {
            Ok(bytes) if bytes.is_empty() => Ok(BTreeMap::new()),
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(BTreeMap::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, entries: &BTreeMap<String, Value>) -> Result<(), PersistError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }
        let data = serde_json::to_vec_pretty(entries)?;
        let tmp = self.path.with_extension("tmp");
        tokio::fs::write(&tmp, data).await?;
        tokio::fs::rename(&tmp, &self.path).await?;
        Ok(())
    }
}

#[async_trait]
impl LocalStore for JsonFileStore {
    async fn get(&self, key: &str) -> Result<Option<Value>, PersistError> {
        let _guard = self.lock.lock().await;
        Ok(self.load().await?.remove(key))
    }

    async fn put(&self, key: &str, value: Value) -> Result<(), PersistError> {
        let _guard = self.lock.lock().await;
        let mut entries = self.load().await?;
        entries.insert(key.to_string(), value);
        self.save(&entries).await
    }

    async fn remove_matching(&self, fragment: &str) -> Result<usize, PersistError> {
        let _guard = self.lock.lock().await;
        let mut entries = self.load().await?;
        let before = entries.len();
        entries.retain(|key, _| !key_mentions(key, fragment));
        let removed = before - entries.len();
        if removed > 0 {
            self.save(&entries).await?;
        }
        Ok(removed)
    }

    async fn keys(&self) -> Result<Vec<String>, PersistError> {
        let _guard = self.lock.lock().await;
        Ok(self.load().await?.into_keys().collect())
    }
}

/// Delete persisted copies mentioning `fragment`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PurgeRequest {
    pub domain: InvalidationDomain,
    pub fragment: String,
}

enum PurgeCommand {
    Persist { key: String, value: Value },
    Purge(PurgeRequest),
    Flush(oneshot::Sender<()>),
}

/// Sending side of the local-copy queue. Cheap to clone.
#[derive(Clone)]
pub struct LocalCopyHandle {
    tx: mpsc::UnboundedSender<PurgeCommand>,
}

impl LocalCopyHandle {
    /// Queue a purge without waiting. Returns false if the worker has stopped.
    pub fn schedule(&self, request: PurgeRequest) -> bool {
        debug!(domain = %request.domain, fragment = %request.fragment, "Scheduled purge");
        self.tx.send(PurgeCommand::Purge(request)).is_ok()
    }

    /// Queue a write of a local copy. Returns false if the worker has stopped.
    pub fn persist(&self, key: impl Into<String>, value: Value) -> bool {
        self.tx
            .send(PurgeCommand::Persist {
                key: key.into(),
                value,
            })
            .is_ok()
    }

    /// Wait until every command queued before this call has been applied.
    pub async fn flush(&self) {
        let (done_tx, done_rx) = oneshot::channel();
        if self.tx.send(PurgeCommand::Flush(done_tx)).is_ok() {
            let _ = done_rx.await;
        }
    }
}

/// Background task applying writes and purges to a [`LocalStore`].
pub struct LocalCopyWorker;

impl LocalCopyWorker {
    /// Spawn the worker. It exits once every [`LocalCopyHandle`] is dropped.
    pub fn spawn(store: Arc<dyn LocalStore>) -> (LocalCopyHandle, JoinHandle<()>) {
        let (tx, mut rx) = mpsc::unbounded_channel::<PurgeCommand>();

        let task = tokio::spawn(async move {
            while let Some(command) = rx.recv().await {
                match command {
                    PurgeCommand::Persist { key, value } => {
                        if let Err(e) = store.put(&key, value).await {
                            warn!(key = %key, error = %e, "Failed to persist local copy");
                        }
                    }
                    PurgeCommand::Purge(request) => match store.remove_matching(&request.fragment).await {
                        Ok(removed) => info!(
                            domain = %request.domain,
                            fragment = %request.fragment,
                            removed,
                            "Purged persisted copies"
                        ),
                        Err(e) => warn!(
                            domain = %request.domain,
                            fragment = %request.fragment,
                            error = %e,
                            "Failed to purge persisted copies"
                        ),
                    },
                    PurgeCommand::Flush(done) => {
                        let _ = done.send(());
                    }
                }
            }
            debug!("Local copy worker stopped");
        });

        (LocalCopyHandle { tx }, task)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_memory_store_remove_matching() {
        let store = MemoryLocalStore::new();
        store.put("recentActivity_u1", json!([1])).await.unwrap();
        store.put("pages:u1:all", json!([2])).await.unwrap();
        store.put("pages:u2:all", json!([3])).await.unwrap();

        assert_eq!(store.remove_matching("u1").await.unwrap(), 2);
        assert_eq!(store.keys().await.unwrap(), vec!["pages:u2:all".to_string()]);
    }

    #[tokio::test]
    async fn test_json_file_store_persists() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("local.json");

        let store = JsonFileStore::new(&path);
        store.put("users:u1", json!({"name": "Ada"})).await.unwrap();
        store.put("users:u2", json!({"name": "Grace"})).await.unwrap();

        let reopened = JsonFileStore::new(&path);
        assert_eq!(reopened.get("users:u1").await.unwrap(), Some(json!({"name": "Ada"})));
        assert_eq!(reopened.remove_matching("u1").await.unwrap(), 1);
        assert_eq!(reopened.keys().await.unwrap(), vec!["users:u2".to_string()]);
    }

    #[tokio::test]
    async fn test_json_file_store_rejects_garbage() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("local.json");
        std::fs::write(&path, b"not json").unwrap();

        let store = JsonFileStore::new(&path);
        assert!(matches!(store.keys().await, Err(PersistError::Json(_))));
    }

    #[tokio::test]
    async fn test_worker_applies_requests_in_order() {
        let store = Arc::new(MemoryLocalStore::new());
        store.put("recentActivity_u1", json!(1)).await.unwrap();
        store.put("recentActivity_u2", json!(2)).await.unwrap();

        let (handle, _task) = LocalCopyWorker::spawn(store.clone());
        assert!(handle.schedule(PurgeRequest {
            domain: InvalidationDomain::RecentActivity,
            fragment: "u1".to_string(),
        }));
        handle.flush().await;

        assert_eq!(store.keys().await.unwrap(), vec!["recentActivity_u2".to_string()]);
    }

    #[tokio::test]
    async fn test_purge_after_write_removes_it() {
        let store = Arc::new(MemoryLocalStore::new());
        let (handle, _task) = LocalCopyWorker::spawn(store.clone());

        assert!(handle.persist("pages:u1", json!("old")));
        assert!(handle.schedule(PurgeRequest {
            domain: InvalidationDomain::UserPages,
            fragment: "u1".to_string(),
        }));
        assert!(handle.persist("pages:u2", json!("kept")));
        handle.flush().await;

        assert_eq!(store.keys().await.unwrap(), vec!["pages:u2".to_string()]);
    }
}
