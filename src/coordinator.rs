//! The store instance: a backend, its mutation lock, and change notifications.
//!
//! Reads load the latest persisted document and traverse it without taking
//! the lock. They may observe a state that an in-flight write is about to
//! replace, but never a partially written one.
//!
//! Writes run one transaction at a time:
//! 1. acquire the lock (bounded by `lock_timeout`)
//! 2. reload the document and re-run traversal against it
//! 3. apply one mutation in memory
//! 4. save the whole document
//! 5. release the lock, whether or not steps 2-4 succeeded
//!
//! Each transaction runs on a spawned task, so cancelling the caller never
//! interrupts steps 1-5 midway.

use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{Result, StoreError};
use crate::lock::{LocalLock, MutationLock};
use crate::path::display_path;
use crate::store::{Document, DocumentBackend};
use crate::traverse::{traverse, ParentHandle, Traversal};
use crate::watch::{WatchEvent, WatchSender, WatchStream};

/// Default bound on waiting for the mutation lock.
pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(10);

/// Unresolved-segment limit for reads and deletes.
pub const READ_MAX_UNRESOLVED: usize = 0;

/// Unresolved-segment limit for writes.
pub const WRITE_MAX_UNRESOLVED: usize = 1;

/// Whether a write inserted a new key or replaced an existing one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// The key did not exist before.
    Created,
    /// The key existed and was overwritten.
    Updated,
}

/// A shared JSON document with coordinated mutation.
#[derive(Clone)]
pub struct TreeStore {
    backend: Arc<dyn DocumentBackend>,
    lock: Arc<dyn MutationLock>,
    lock_timeout: Duration,
    watcher: WatchSender,
}

impl TreeStore {
    /// Create a store from a backend and the lock serializing its writers.
    pub fn new(backend: Arc<dyn DocumentBackend>, lock: Arc<dyn MutationLock>) -> Self {
        Self {
            backend,
            lock,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
            watcher: WatchSender::default(),
        }
    }

    /// Create a store whose writers are serialized by an in-process lock.
    pub fn with_local_lock(backend: impl DocumentBackend + 'static) -> Self {
        Self::new(Arc::new(backend), Arc::new(LocalLock::new()))
    }

    /// Change how long a writer waits for the lock.
    pub fn with_lock_timeout(mut self, lock_timeout: Duration) -> Self {
        self.lock_timeout = lock_timeout;
        self
    }

    /// The configured lock timeout.
    pub fn lock_timeout(&self) -> Duration {
        self.lock_timeout
    }

    /// Load the whole document.
    pub async fn document(&self) -> Result<Document> {
        self.backend.load().await
    }

    /// Read the value at `path`.
    pub async fn get(&self, path: &[String]) -> Result<Value> {
        let document = self.backend.load().await?;
        let traversal = traverse(&document, path, READ_MAX_UNRESOLVED)?;
        Ok(traversal.current().to_value())
    }

    /// Set the value at `path`, creating at most the final key.
    pub async fn put(&self, path: &[String], value: Value) -> Result<WriteOutcome> {
        self.spawn_transaction(path, WRITE_MAX_UNRESOLVED, move |document, handle| {
            let old_value = handle.set(document, value.clone())?;
            let outcome = if old_value.is_some() {
                WriteOutcome::Updated
            } else {
                WriteOutcome::Created
            };
            let event = WatchEvent::written(display_path(&handle.path()), old_value, value);
            Ok((outcome, event))
        })
        .await
    }

    /// Remove the key at `path`, returning its value.
    pub async fn delete(&self, path: &[String]) -> Result<Value> {
        self.spawn_transaction(path, READ_MAX_UNRESOLVED, |document, handle| {
            let removed = handle.remove(document)?;
            let event = WatchEvent::deleted(display_path(&handle.path()), removed.clone());
            Ok((removed, event))
        })
        .await
    }

    /// Subscribe to committed changes matching `pattern`.
    pub fn watch(&self, pattern: &str) -> WatchStream {
        self.watcher.subscribe(pattern)
    }

    /// Run a transaction on its own task.
    ///
    /// Dropping the returned future only stops waiting for the result. The
    /// transaction still saves and releases the lock, in that order, so a
    /// cancelled writer can never overwrite a later writer's commit.
    async fn spawn_transaction<T, F>(
        &self,
        path: &[String],
        max_unresolved: usize,
        mutate: F,
    ) -> Result<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut Document, &ParentHandle) -> Result<(T, WatchEvent)> + Send + 'static,
    {
        let store = self.clone();
        let path = path.to_vec();
        let task =
            tokio::spawn(async move { store.transact(&path, max_unresolved, mutate).await });

        match task.await {
            Ok(result) => result,
            Err(e) if e.is_panic() => std::panic::resume_unwind(e.into_panic()),
            Err(e) => Err(StoreError::TaskFailed(e.to_string())),
        }
    }

    async fn transact<T, F>(&self, path: &[String], max_unresolved: usize, mutate: F) -> Result<T>
    where
        F: FnOnce(&mut Document, &ParentHandle) -> Result<(T, WatchEvent)>,
    {
        // Reject unreachable paths before queueing for the lock.
        let snapshot = self.backend.load().await?;
        let traversal = traverse(&snapshot, path, max_unresolved)?;
        traversal.parent()?;

        let guard = self.lock.acquire(self.lock_timeout).await?;

        let outcome = self.refresh_mutate_save(&traversal, mutate).await;

        if let Err(e) = guard.release().await {
            warn!("Failed to release store lock: {}", e);
        }

        let (value, event) = outcome?;
        self.watcher.send(event);
        Ok(value)
    }

    async fn refresh_mutate_save<T, F>(
        &self,
        traversal: &Traversal<'_>,
        mutate: F,
    ) -> Result<(T, WatchEvent)>
    where
        F: FnOnce(&mut Document, &ParentHandle) -> Result<(T, WatchEvent)>,
    {
        let mut document = self.backend.load().await?;
        let handle = traversal.refresh(&document)?.parent()?;

        let outcome = mutate(&mut document, &handle)?;
        self.backend.save(&document).await?;

        debug!(
            "Committed mutation at {} via {} backend",
            display_path(traversal.path()),
            self.backend.name()
        );
        Ok(outcome)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBackend;
    use crate::watch::EventType;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};
    use tokio_stream::StreamExt;

    fn path(segments: &[&str]) -> Vec<String> {
        segments.iter().map(|s| s.to_string()).collect()
    }

    /// Backend whose saves can be made to fail.
    struct FlakyBackend {
        inner: MemoryBackend,
        fail_saves: AtomicBool,
    }

    #[async_trait]
    impl DocumentBackend for FlakyBackend {
        async fn load(&self) -> Result<Document> {
            self.inner.load().await
        }

        async fn save(&self, document: &Document) -> Result<()> {
            if self.fail_saves.load(Ordering::SeqCst) {
                return Err(StoreError::IoError(std::io::Error::new(
                    std::io::ErrorKind::Other,
                    "disk full",
                )));
            }
            self.inner.save(document).await
        }

        fn name(&self) -> &'static str {
            "flaky"
        }
    }

    #[tokio::test]
    async fn test_put_then_get() {
        let store = TreeStore::with_local_lock(MemoryBackend::new());

        let outcome = store.put(&path(&["foo"]), json!({"bar": 1})).await.unwrap();
        assert_eq!(outcome, WriteOutcome::Created);
        assert_eq!(store.get(&path(&["foo"])).await.unwrap(), json!({"bar": 1}));
        assert_eq!(store.get(&path(&["foo", "bar"])).await.unwrap(), json!(1));
    }

    #[tokio::test]
    async fn test_put_overwrites_existing() {
        let store = TreeStore::with_local_lock(MemoryBackend::new());

        store.put(&path(&["k"]), json!(1)).await.unwrap();
        let outcome = store.put(&path(&["k"]), json!(2)).await.unwrap();

        assert_eq!(outcome, WriteOutcome::Updated);
        assert_eq!(store.get(&path(&["k"])).await.unwrap(), json!(2));
    }

    #[tokio::test]
    async fn test_put_nested_under_existing_parent() {
        let store = TreeStore::with_local_lock(MemoryBackend::new());

        store.put(&path(&["a"]), json!({})).await.unwrap();
        store.put(&path(&["a", "b"]), json!("x")).await.unwrap();

        assert_eq!(store.get(&[]).await.unwrap(), json!({"a": {"b": "x"}}));
    }

    #[tokio::test]
    async fn test_put_missing_parent_is_not_found() {
        let store = TreeStore::with_local_lock(MemoryBackend::new());

        let err = store.put(&path(&["a", "b"]), json!(1)).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_put_root_is_bad_request() {
        let store = TreeStore::with_local_lock(MemoryBackend::new());

        let err = store.put(&[], json!({"a": 1})).await.unwrap_err();
        assert!(matches!(err, StoreError::BadRequest(_)));
    }

    #[tokio::test]
    async fn test_delete() {
        let store = TreeStore::with_local_lock(MemoryBackend::new());
        store.put(&path(&["foo"]), json!({"bar": 1})).await.unwrap();

        let removed = store.delete(&path(&["foo"])).await.unwrap();
        assert_eq!(removed, json!({"bar": 1}));

        let err = store.get(&path(&["foo"])).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
        assert_eq!(store.get(&[]).await.unwrap(), json!({}));
    }

    #[tokio::test]
    async fn test_delete_missing_is_not_found() {
        let store = TreeStore::with_local_lock(MemoryBackend::new());

        let err = store.delete(&path(&["nope"])).await.unwrap_err();
        assert!(matches!(err, StoreError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_delete_root_is_bad_request() {
        let store = TreeStore::with_local_lock(MemoryBackend::new());

        let err = store.delete(&[]).await.unwrap_err();
        assert!(matches!(err, StoreError::BadRequest(_)));
    }

    #[tokio::test]
    async fn test_mutation_uses_latest_document() {
        let backend = MemoryBackend::new();
        let store = TreeStore::with_local_lock(backend.clone());

        store.put(&path(&["a"]), json!(1)).await.unwrap();

        // Another writer commits behind the store's back.
        let mut external = backend.load().await.unwrap();
        external.insert("b".to_string(), json!(2));
        backend.save(&external).await.unwrap();

        store.put(&path(&["c"]), json!(3)).await.unwrap();
        assert_eq!(
            store.get(&[]).await.unwrap(),
            json!({"a": 1, "b": 2, "c": 3})
        );
    }

    #[tokio::test]
    async fn test_failed_save_releases_lock_and_keeps_document() {
        let backend = Arc::new(FlakyBackend {
            inner: MemoryBackend::new(),
            fail_saves: AtomicBool::new(true),
        });
        let store = TreeStore::new(backend.clone(), Arc::new(LocalLock::new()))
            .with_lock_timeout(Duration::from_millis(100));

        let err = store.put(&path(&["a"]), json!(1)).await.unwrap_err();
        assert!(matches!(err, StoreError::IoError(_)));
        assert_eq!(store.get(&[]).await.unwrap(), json!({}));

        backend.fail_saves.store(false, Ordering::SeqCst);
        store.put(&path(&["a"]), json!(1)).await.unwrap();
        assert_eq!(store.get(&path(&["a"])).await.unwrap(), json!(1));
    }

    #[tokio::test]
    async fn test_lock_timeout_surfaces() {
        let lock = Arc::new(LocalLock::new());
        let store = TreeStore::new(Arc::new(MemoryBackend::new()), lock.clone())
            .with_lock_timeout(Duration::from_millis(30));

        let held = lock.acquire(Duration::from_millis(30)).await.unwrap();
        let err = store.put(&path(&["a"]), json!(1)).await.unwrap_err();
        assert!(matches!(err, StoreError::LockTimeout(_)));

        // Reads never wait for the lock.
        assert_eq!(store.get(&[]).await.unwrap(), json!({}));
        held.release().await.unwrap();

        store.put(&path(&["a"]), json!(1)).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_puts_lose_nothing() {
        let store = TreeStore::with_local_lock(MemoryBackend::new());

        let tasks: Vec<_> = (0..50)
            .map(|i| {
                let store = store.clone();
                tokio::spawn(async move {
                    store
                        .put(&[format!("key{}", i)], json!(i))
                        .await
                        .unwrap();
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        let document = store.document().await.unwrap();
        assert_eq!(document.len(), 50);
        for i in 0..50 {
            assert_eq!(document.get(&format!("key{}", i)), Some(&json!(i)));
        }
    }

    #[tokio::test]
    async fn test_watch_receives_committed_changes() {
        let store = TreeStore::with_local_lock(MemoryBackend::new());
        let mut stream = store.watch("/users/*");

        store.put(&path(&["users"]), json!({})).await.unwrap();
        store.put(&path(&["users", "alice"]), json!(1)).await.unwrap();
        store.put(&path(&["users", "alice"]), json!(2)).await.unwrap();
        store.delete(&path(&["users", "alice"])).await.unwrap();

        let created = stream.next().await.unwrap();
        assert_eq!(created.path, "/users/alice");
        assert_eq!(created.event_type, EventType::Created);

        let updated = stream.next().await.unwrap();
        assert_eq!(updated.event_type, EventType::Updated);
        assert_eq!(updated.old_value, Some(json!(1)));

        let deleted = stream.next().await.unwrap();
        assert_eq!(deleted.event_type, EventType::Deleted);
        assert_eq!(deleted.old_value, Some(json!(2)));
    }

    #[tokio::test]
    async fn test_failed_mutation_sends_no_event() {
        let store = TreeStore::with_local_lock(MemoryBackend::new());
        let mut stream = store.watch("*");

        assert!(store.delete(&path(&["missing"])).await.is_err());
        store.put(&path(&["present"]), json!(true)).await.unwrap();

        let event = stream.next().await.unwrap();
        assert_eq!(event.path, "/present");
    }

    /// Backend whose saves run on a blocking thread, the first one slowly.
    struct BlockingSaveBackend {
        inner: MemoryBackend,
        first_save: AtomicBool,
    }

    #[async_trait]
    impl DocumentBackend for BlockingSaveBackend {
        async fn load(&self) -> Result<Document> {
            self.inner.load().await
        }

        async fn save(&self, document: &Document) -> Result<()> {
            let delay = if self.first_save.swap(false, Ordering::SeqCst) {
                Duration::from_millis(300)
            } else {
                Duration::from_millis(10)
            };
            let inner = self.inner.clone();
            let document = document.clone();
            tokio::task::spawn_blocking(move || {
                std::thread::sleep(delay);
                futures::executor::block_on(inner.save(&document))
            })
            .await
            .map_err(|e| StoreError::TaskFailed(e.to_string()))?
        }

        fn name(&self) -> &'static str {
            "blocking"
        }
    }

    #[tokio::test]
    async fn test_cancelled_writer_keeps_lock_until_saved() {
        let mut seed = Document::new();
        seed.insert("seed".to_string(), json!(true));
        let inner = MemoryBackend::with_document(seed);
        let store = TreeStore::with_local_lock(BlockingSaveBackend {
            inner: inner.clone(),
            first_save: AtomicBool::new(true),
        });

        let cancelled = tokio::time::timeout(
            Duration::from_millis(50),
            store.put(&path(&["w1"]), json!(1)),
        )
        .await;
        assert!(cancelled.is_err());

        store.put(&path(&["w2"]), json!(2)).await.unwrap();

        assert_eq!(inner.len(), 3);
        assert_eq!(
            store.get(&[]).await.unwrap(),
            json!({"seed": true, "w1": 1, "w2": 2})
        );
    }

    #[tokio::test]
    async fn test_cancelled_writer_still_notifies() {
        let store = TreeStore::with_local_lock(BlockingSaveBackend {
            inner: MemoryBackend::new(),
            first_save: AtomicBool::new(true),
        });
        let mut stream = store.watch("*");

        let cancelled = tokio::time::timeout(
            Duration::from_millis(50),
            store.delete(&path(&["absent"])),
        )
        .await;
        assert!(matches!(cancelled, Ok(Err(StoreError::NotFound(_)))));

        let _ = tokio::time::timeout(
            Duration::from_millis(50),
            store.put(&path(&["late"]), json!("x")),
        )
        .await;

        let event = stream.next().await.unwrap();
        assert_eq!(event.path, "/late");
        assert_eq!(event.event_type, EventType::Created);
    }
}
