//! # univrs-jsonkv
//!
//! A single shared JSON document exposed as a hierarchical key-value store.
//!
//! Each segment of a slash-delimited path selects one level of nesting:
//! `/users/alice/email` addresses `document["users"]["alice"]["email"]`.
//!
//! - **Strict traversal**: reads and deletes need the whole path to exist;
//!   writes may create exactly one new key under an existing object
//! - **Whole-document persistence**: the document is always loaded and
//!   saved as one unit, either to a JSON file or as append-only SQLite
//!   snapshots
//! - **Coordinated writes**: every mutation runs under one exclusive,
//!   timeout-bounded lock and is computed against a freshly reloaded
//!   document, so concurrent writers never lose each other's updates
//! - **HTTP surface**: `GET`, `PUT` and `DELETE` on any path via axum
//!
//! ## Backends
//!
//! - [`FileBackend`]: one JSON file, paired with a [`LocalLock`]
//! - [`SqliteBackend`]: append-only snapshots, paired with a [`SqliteLock`]
//! - [`MemoryBackend`]: in-memory (testing and embedding)
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use serde_json::json;
//! use univrs_jsonkv::{MemoryBackend, TreeStore};
//!
//! #[tokio::main]
//! async fn main() -> univrs_jsonkv::Result<()> {
//!     let store = TreeStore::with_local_lock(MemoryBackend::new());
//!
//!     store.put(&["foo".to_string()], json!({"bar": 1})).await?;
//!     let bar = store.get(&["foo".to_string(), "bar".to_string()]).await?;
//!     assert_eq!(bar, json!(1));
//!
//!     Ok(())
//! }
//! ```
//!
//! ## Serving HTTP
//!
//! ```rust,no_run
//! use univrs_jsonkv::{server, SqliteBackend, TreeStore};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> univrs_jsonkv::Result<()> {
//!     let backend = SqliteBackend::open("root_tree.db").await?;
//!     let lock = backend.lock();
//!     let store = TreeStore::new(Arc::new(backend), Arc::new(lock));
//!
//!     let listener = tokio::net::TcpListener::bind("127.0.0.1:8000").await?;
//!     server::serve(listener, store, async {
//!         let _ = tokio::signal::ctrl_c().await;
//!     })
//!     .await
//! }
//! ```

pub mod config;
pub mod coordinator;
pub mod error;
pub mod file;
pub mod handler;
pub mod lock;
pub mod memory;
pub mod path;
pub mod server;
pub mod sqlite;
pub mod store;
pub mod traverse;
pub mod watch;

// Re-export main types
pub use config::{BackendConfig, ServerConfig};
pub use coordinator::{TreeStore, WriteOutcome};
pub use error::{Result, StoreError};
pub use file::FileBackend;
pub use lock::{LocalLock, LockGuard, MutationLock};
pub use memory::MemoryBackend;
pub use path::parse_path;
pub use sqlite::{SnapshotInfo, SqliteBackend, SqliteLock};
pub use store::{Document, DocumentBackend};
pub use traverse::{traverse, ParentHandle, Traversal};
pub use watch::{EventType, WatchEvent, WatchStream};

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::coordinator::{TreeStore, WriteOutcome};
    pub use crate::error::{Result, StoreError};
    pub use crate::file::FileBackend;
    pub use crate::lock::{LocalLock, MutationLock};
    pub use crate::memory::MemoryBackend;
    pub use crate::sqlite::{SqliteBackend, SqliteLock};
    pub use crate::store::{Document, DocumentBackend};
}
