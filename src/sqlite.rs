//! SQLite snapshot backend.
//!
//! The document is stored as an append-only series of snapshots:
//! - every save inserts a new row inside a transaction
//! - the current document is the row with the highest id
//! - rows are never updated or deleted
//!
//! The same database also hosts [`SqliteLock`], a lease-based lock shared by
//! every process that opens the file.

use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePool, SqlitePoolOptions};
use std::path::Path;
use std::str::FromStr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

use crate::error::{Result, StoreError};
use crate::lock::{LockGuard, LockLease, MutationLock};
use crate::store::{decode_document, encode_document, Document, DocumentBackend};

/// Name of the lock row guarding the document.
pub const DOCUMENT_LOCK: &str = "root_tree";

/// Default lifetime of a lock lease.
pub const DEFAULT_LEASE: Duration = Duration::from_secs(60);

const LOCK_POLL_MIN: Duration = Duration::from_millis(2);
const LOCK_POLL_MAX: Duration = Duration::from_millis(50);

static HOLDER_SEQ: AtomicU64 = AtomicU64::new(0);

/// Metadata of one stored snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotInfo {
    /// Monotonically increasing snapshot id.
    pub id: i64,
    /// Creation time.
    pub created_at: SystemTime,
}

/// SQLite implementation of DocumentBackend.
///
/// Uses WAL mode so readers never block the writer.
#[derive(Clone)]
pub struct SqliteBackend {
    pool: SqlitePool,
}

impl SqliteBackend {
    /// Open or create a snapshot store at the given path.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        info!("Opening SQLite snapshot store at {:?}", path);

        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path.display()))?
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .synchronous(sqlx::sqlite::SqliteSynchronous::Normal)
            .busy_timeout(Duration::from_secs(30));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        let backend = Self { pool };
        backend.init_schema().await?;
        Ok(backend)
    }

    /// Create an in-memory snapshot store (for testing).
    pub async fn in_memory() -> Result<Self> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;

        // One connection, kept open forever: each connection gets its own
        // private in-memory database.
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;

        let backend = Self { pool };
        backend.init_schema().await?;
        Ok(backend)
    }

    /// Create tables and the initial empty snapshot if absent.
    async fn init_schema(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS root_tree (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                created_at INTEGER NOT NULL,
                tree TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS store_locks (
                name TEXT PRIMARY KEY NOT NULL,
                holder TEXT NOT NULL,
                expires_at INTEGER NOT NULL
            );
            "#,
        )
        .execute(&self.pool)
        .await?;

        let mut tx = self.pool.begin().await?;
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM root_tree")
            .fetch_one(&mut *tx)
            .await?;
        if count == 0 {
            info!("Inserting initial empty snapshot");
            sqlx::query("INSERT INTO root_tree (created_at, tree) VALUES (?, '{}')")
                .bind(now_millis())
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;

        debug!("SQLite schema initialized");
        Ok(())
    }

    /// Lock sharing this backend's database, with the default lease.
    pub fn lock(&self) -> SqliteLock {
        SqliteLock::new(self.pool.clone(), DOCUMENT_LOCK, DEFAULT_LEASE)
    }

    /// Number of stored snapshots.
    pub async fn snapshot_count(&self) -> Result<u64> {
        let (count,): (i64,) = sqlx::query_as("SELECT COUNT(*) FROM root_tree")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }

    /// Most recent snapshots, newest first.
    pub async fn history(&self, limit: u32) -> Result<Vec<SnapshotInfo>> {
        let rows: Vec<(i64, i64)> =
            sqlx::query_as("SELECT id, created_at FROM root_tree ORDER BY id DESC LIMIT ?")
                .bind(limit as i64)
                .fetch_all(&self.pool)
                .await?;

        Ok(rows
            .into_iter()
            .map(|(id, created_at)| SnapshotInfo {
                id,
                created_at: millis_to_system_time(created_at),
            })
            .collect())
    }

    /// Load a specific snapshot. Returns `None` if the id does not exist.
    pub async fn load_snapshot(&self, id: i64) -> Result<Option<Document>> {
        let row: Option<(String,)> = sqlx::query_as("SELECT tree FROM root_tree WHERE id = ?")
            .bind(id)
            .fetch_optional(&self.pool)
            .await?;

        row.map(|(tree,)| decode_document(tree.as_bytes()))
            .transpose()
    }
}

#[async_trait]
impl DocumentBackend for SqliteBackend {
    async fn load(&self) -> Result<Document> {
        let row: Option<(String,)> =
            sqlx::query_as("SELECT tree FROM root_tree ORDER BY id DESC LIMIT 1")
                .fetch_optional(&self.pool)
                .await?;

        match row {
            Some((tree,)) => decode_document(tree.as_bytes()),
            None => Err(StoreError::CorruptDocument(
                "snapshot table is empty".to_string(),
            )),
        }
    }

    async fn save(&self, document: &Document) -> Result<()> {
        let bytes = encode_document(document)?;
        let tree = String::from_utf8(bytes)
            .map_err(|e| StoreError::SerializationError(e.to_string()))?;

        let mut tx = self.pool.begin().await?;
        let result = sqlx::query("INSERT INTO root_tree (created_at, tree) VALUES (?, ?)")
            .bind(now_millis())
            .bind(&tree)
            .execute(&mut *tx)
            .await?;
        tx.commit().await?;

        debug!("Inserted snapshot {}", result.last_insert_rowid());
        Ok(())
    }

    fn name(&self) -> &'static str {
        "sqlite"
    }
}

/// Lease lock stored in the `store_locks` table.
///
/// A lease is taken when the lock row is absent or expired. A holder that
/// crashes stops blocking others once its lease runs out.
#[derive(Clone)]
pub struct SqliteLock {
    pool: SqlitePool,
    name: String,
    lease: Duration,
    holder_prefix: String,
}

impl SqliteLock {
    /// Create a lock named `name` whose leases last `lease`.
    pub fn new(pool: SqlitePool, name: impl Into<String>, lease: Duration) -> Self {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.subsec_nanos())
            .unwrap_or_default();
        Self {
            pool,
            name: name.into(),
            lease,
            holder_prefix: format!("{}-{:08x}", std::process::id(), nanos),
        }
    }

    /// Change the lease duration.
    pub fn with_lease(mut self, lease: Duration) -> Self {
        self.lease = lease;
        self
    }

    async fn try_acquire(&self, holder: &str) -> Result<bool> {
        let now = now_millis();
        let expires_at = now + self.lease.as_millis() as i64;

        let result = sqlx::query(
            r#"
            INSERT INTO store_locks (name, holder, expires_at)
            VALUES (?, ?, ?)
            ON CONFLICT(name) DO UPDATE SET
                holder = excluded.holder,
                expires_at = excluded.expires_at
            WHERE store_locks.expires_at < ?
            "#,
        )
        .bind(&self.name)
        .bind(holder)
        .bind(expires_at)
        .bind(now)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }
}

struct SqliteLease {
    pool: SqlitePool,
    name: String,
    holder: String,
}

#[async_trait]
impl LockLease for SqliteLease {
    async fn release(self: Box<Self>) -> Result<()> {
        let result = sqlx::query("DELETE FROM store_locks WHERE name = ? AND holder = ?")
            .bind(&self.name)
            .bind(&self.holder)
            .execute(&self.pool)
            .await?;

        if result.rows_affected() == 0 {
            warn!(
                "Lease {} on lock {:?} had already expired",
                self.holder, self.name
            );
        }
        Ok(())
    }
}

#[async_trait]
impl MutationLock for SqliteLock {
    async fn acquire(&self, timeout: Duration) -> Result<LockGuard> {
        let holder = format!(
            "{}-{}",
            self.holder_prefix,
            HOLDER_SEQ.fetch_add(1, Ordering::Relaxed)
        );
        let deadline = Instant::now() + timeout;
        let mut backoff = LOCK_POLL_MIN;

        loop {
            if self.try_acquire(&holder).await? {
                debug!("Acquired lock {:?} as {}", self.name, holder);
                return Ok(LockGuard::new(SqliteLease {
                    pool: self.pool.clone(),
                    name: self.name.clone(),
                    holder,
                }));
            }

            if Instant::now() >= deadline {
                warn!("Timed out after {:?} waiting for lock {:?}", timeout, self.name);
                return Err(StoreError::LockTimeout(timeout));
            }
            tokio::time::sleep(backoff).await;
            backoff = (backoff * 2).min(LOCK_POLL_MAX);
        }
    }
}

fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or_default()
}

fn millis_to_system_time(millis: i64) -> SystemTime {
    UNIX_EPOCH + Duration::from_millis(millis.max(0) as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_initial_snapshot_is_empty_object() {
        let backend = SqliteBackend::in_memory().await.unwrap();

        assert_eq!(backend.snapshot_count().await.unwrap(), 1);
        assert!(backend.load().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_save_appends_snapshot() {
        let backend = SqliteBackend::in_memory().await.unwrap();

        let mut document = Document::new();
        document.insert("a".to_string(), json!(1));
        backend.save(&document).await.unwrap();

        document.insert("b".to_string(), json!(2));
        backend.save(&document).await.unwrap();

        assert_eq!(backend.snapshot_count().await.unwrap(), 3);
        assert_eq!(backend.load().await.unwrap(), document);
    }

    #[tokio::test]
    async fn test_history_newest_first() {
        let backend = SqliteBackend::in_memory().await.unwrap();
        backend.save(&Document::new()).await.unwrap();
        backend.save(&Document::new()).await.unwrap();

        let history = backend.history(10).await.unwrap();
        assert_eq!(history.len(), 3);
        assert!(history[0].id > history[1].id);
        assert!(history[1].id > history[2].id);

        let limited = backend.history(1).await.unwrap();
        assert_eq!(limited, vec![history[0].clone()]);
    }

    #[tokio::test]
    async fn test_old_snapshots_are_immutable() {
        let backend = SqliteBackend::in_memory().await.unwrap();
        let first = backend.history(1).await.unwrap()[0].id;

        let mut document = Document::new();
        document.insert("k".to_string(), json!("v"));
        backend.save(&document).await.unwrap();

        assert_eq!(backend.load_snapshot(first).await.unwrap(), Some(Document::new()));
        assert_eq!(backend.load_snapshot(9999).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_reopen_keeps_latest_snapshot() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tree.db");

        {
            let backend = SqliteBackend::open(&path).await.unwrap();
            let mut document = Document::new();
            document.insert("persisted".to_string(), json!(true));
            backend.save(&document).await.unwrap();
        }

        let backend = SqliteBackend::open(&path).await.unwrap();
        assert_eq!(backend.snapshot_count().await.unwrap(), 2);
        assert_eq!(
            backend.load().await.unwrap().get("persisted"),
            Some(&json!(true))
        );
    }

    #[tokio::test]
    async fn test_lock_is_exclusive() {
        let backend = SqliteBackend::in_memory().await.unwrap();
        let lock = backend.lock();

        let held = lock.acquire(Duration::from_millis(50)).await.unwrap();
        let err = lock.acquire(Duration::from_millis(50)).await.unwrap_err();
        assert!(matches!(err, StoreError::LockTimeout(_)));

        held.release().await.unwrap();
        let guard = lock.acquire(Duration::from_millis(50)).await.unwrap();
        guard.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_expired_lease_can_be_taken_over() {
        let backend = SqliteBackend::in_memory().await.unwrap();
        let crashed = backend.lock().with_lease(Duration::from_millis(20));
        let survivor = backend.lock();

        let abandoned = crashed.acquire(Duration::from_millis(50)).await.unwrap();
        std::mem::forget(abandoned);

        let guard = survivor.acquire(Duration::from_secs(2)).await.unwrap();
        guard.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_dropped_sqlite_guard_releases() {
        let backend = SqliteBackend::in_memory().await.unwrap();
        let lock = backend.lock();
        assert_eq!(lock.lease, DEFAULT_LEASE);

        {
            let _guard = lock.acquire(Duration::from_millis(50)).await.unwrap();
        }

        // Well inside the lease, so only the background release frees the row.
        let guard = lock.acquire(Duration::from_secs(2)).await.unwrap();
        guard.release().await.unwrap();
    }

    #[tokio::test]
    async fn test_locks_from_separate_connections_exclude_each_other() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("tree.db");
        let first = SqliteBackend::open(&path).await.unwrap();
        let second = SqliteBackend::open(&path).await.unwrap();

        let held = first.lock().acquire(Duration::from_millis(50)).await.unwrap();
        let err = second
            .lock()
            .acquire(Duration::from_millis(50))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::LockTimeout(_)));
        held.release().await.unwrap();
    }
}
