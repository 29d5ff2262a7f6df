//! Server configuration via a TOML file.
//!
//! Every field has a default, so an empty file (or no file) yields a server
//! on `127.0.0.1:8000` storing its document in `root_tree.json`.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use crate::coordinator::{TreeStore, DEFAULT_LOCK_TIMEOUT};
use crate::error::{Result, StoreError};
use crate::file::FileBackend;
use crate::sqlite::{SqliteBackend, DEFAULT_LEASE};

/// Where and how the document is persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum BackendConfig {
    /// One JSON file, replaced on every write; in-process lock.
    File {
        #[serde(default = "default_file_path")]
        path: PathBuf,
    },
    /// Append-only snapshots in SQLite; lease lock in the same database.
    Sqlite {
        #[serde(default = "default_sqlite_path")]
        path: PathBuf,
        #[serde(default = "default_lease_ms")]
        lease_ms: u64,
    },
}

fn default_file_path() -> PathBuf {
    PathBuf::from("root_tree.json")
}

fn default_sqlite_path() -> PathBuf {
    PathBuf::from("root_tree.db")
}

fn default_lease_ms() -> u64 {
    DEFAULT_LEASE.as_millis() as u64
}

impl Default for BackendConfig {
    fn default() -> Self {
        BackendConfig::File {
            path: default_file_path(),
        }
    }
}

/// Server configuration.
///
/// # Example
///
/// ```toml
/// bind = "127.0.0.1:8000"
/// lock_timeout_ms = 10000
///
/// [backend]
/// kind = "sqlite"
/// path = "root_tree.db"
/// lease_ms = 60000
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Listen address.
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Upper bound on waiting for the mutation lock.
    #[serde(default = "default_lock_timeout_ms")]
    pub lock_timeout_ms: u64,
    /// Persistence backend.
    #[serde(default)]
    pub backend: BackendConfig,
}

fn default_bind() -> String {
    "127.0.0.1:8000".to_string()
}

fn default_lock_timeout_ms() -> u64 {
    DEFAULT_LOCK_TIMEOUT.as_millis() as u64
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            lock_timeout_ms: default_lock_timeout_ms(),
            backend: BackendConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Returns the default config file content with comments.
    pub fn default_toml() -> &'static str {
        r#"# univrs-jsonkv server configuration

# Address to listen on.
bind = "127.0.0.1:8000"

# How long a write waits for the store lock before failing (milliseconds).
lock_timeout_ms = 10000

# Persistence backend.
#   kind = "file"   : one JSON file, rewritten on every write
#   kind = "sqlite" : append-only snapshots, lock shared across processes
[backend]
kind = "file"
path = "root_tree.json"

# [backend]
# kind = "sqlite"
# path = "root_tree.db"
# lease_ms = 60000
"#
    }

    /// Parse config from TOML text.
    pub fn from_toml(content: &str) -> Result<Self> {
        toml::from_str(content).map_err(|e| StoreError::InvalidConfig(e.to_string()))
    }

    /// Read and parse config from a file path.
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml(&content)
    }

    /// The lock timeout as a duration.
    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    /// Open the configured backend and pair it with its lock.
    pub async fn open_store(&self) -> Result<TreeStore> {
        let store = match &self.backend {
            BackendConfig::File { path } => TreeStore::with_local_lock(FileBackend::new(path)),
            BackendConfig::Sqlite { path, lease_ms } => {
                let backend = SqliteBackend::open(path).await?;
                let lock = backend.lock().with_lease(Duration::from_millis(*lease_ms));
                TreeStore::new(Arc::new(backend), Arc::new(lock))
            }
        };
        Ok(store.with_lock_timeout(self.lock_timeout()))
    }
}
