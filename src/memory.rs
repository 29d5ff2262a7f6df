//! In-memory document backend.
//!
//! This implementation is NOT durable - data is lost on process exit.
//! Use for testing and embedding only.

use async_trait::async_trait;
use parking_lot::RwLock;
use std::sync::Arc;

use crate::error::Result;
use crate::store::{Document, DocumentBackend};

/// In-memory implementation of DocumentBackend.
///
/// `load` hands out a copy, so callers never alias the stored document.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    document: Arc<RwLock<Document>>,
}

impl MemoryBackend {
    /// Create a backend holding an empty document.
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a backend seeded with `document`.
    pub fn with_document(document: Document) -> Self {
        Self {
            document: Arc::new(RwLock::new(document)),
        }
    }

    /// Number of top-level keys.
    pub fn len(&self) -> usize {
        self.document.read().len()
    }

    /// Check if the document is empty.
    pub fn is_empty(&self) -> bool {
        self.document.read().is_empty()
    }
}

#[async_trait]
impl DocumentBackend for MemoryBackend {
    async fn load(&self) -> Result<Document> {
        Ok(self.document.read().clone())
    }

    async fn save(&self, document: &Document) -> Result<()> {
        *self.document.write() = document.clone();
        Ok(())
    }

    fn name(&self) -> &'static str {
        "memory"
    }
}
