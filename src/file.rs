//! Single-file document backend.
//!
//! The whole document lives in one JSON file that is replaced on every
//! save. Saves go to a sibling temporary file which is then renamed over
//! the target, so readers see either the old or the new document.
//!
//! The backend itself does not serialize writers. Pair it with a
//! [`LocalLock`](crate::LocalLock) or use it from a single writer.

use async_trait::async_trait;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info};

use crate::error::Result;
use crate::store::{decode_document, encode_document, Document, DocumentBackend};

/// File implementation of DocumentBackend.
pub struct FileBackend {
    path: PathBuf,
    tmp_counter: AtomicU64,
}

impl FileBackend {
    /// Use the document stored at `path`. The file is created on first save.
    pub fn new(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();
        info!("Using JSON document file at {:?}", path);
        Self {
            path,
            tmp_counter: AtomicU64::new(0),
        }
    }

    /// Path of the document file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn tmp_path(&self) -> PathBuf {
        let n = self.tmp_counter.fetch_add(1, Ordering::Relaxed);
        let name = self
            .path
            .file_name()
            .map(|f| f.to_string_lossy().into_owned())
            .unwrap_or_else(|| "document".to_string());
        self.path
            .with_file_name(format!(".{}.{}.{}.tmp", name, std::process::id(), n))
    }
}

#[async_trait]
impl DocumentBackend for FileBackend {
    async fn load(&self) -> Result<Document> {
        match fs::read(&self.path).await {
            Ok(bytes) => decode_document(&bytes),
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!("No document at {:?}, starting empty", self.path);
                Ok(Document::new())
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn save(&self, document: &Document) -> Result<()> {
        let bytes = encode_document(document)?;
        let tmp = self.tmp_path();

        let written = async {
            let mut file = fs::File::create(&tmp).await?;
            file.write_all(&bytes).await?;
            file.sync_all().await?;
            fs::rename(&tmp, &self.path).await
        }
        .await;

        if let Err(e) = written {
            let _ = fs::remove_file(&tmp).await;
            return Err(e.into());
        }

        debug!("Wrote {} bytes to {:?}", bytes.len(), self.path);
        Ok(())
    }

    fn name(&self) -> &'static str {
        "file"
    }
}
