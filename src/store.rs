//! DocumentBackend trait - the persistence abstraction for the shared document.
//!
//! A backend stores exactly one document and only ever loads or saves it
//! whole. Backends make no promise about concurrent read-modify-write
//! cycles; that is the job of the [`TreeStore`](crate::TreeStore) and its
//! [`MutationLock`](crate::MutationLock).

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::error::{Result, StoreError};

/// The root of the store: a JSON object.
pub type Document = Map<String, Value>;

/// Whole-document persistence.
#[async_trait]
pub trait DocumentBackend: Send + Sync {
    /// Load the latest persisted document.
    async fn load(&self) -> Result<Document>;

    /// Persist `document` as a single atomic unit.
    async fn save(&self, document: &Document) -> Result<()>;

    /// Short backend name used in log output.
    fn name(&self) -> &'static str;
}

/// Decode a serialized document, rejecting any root that is not an object.
pub fn decode_document(bytes: &[u8]) -> Result<Document> {
    match serde_json::from_slice::<Value>(bytes)? {
        Value::Object(map) => Ok(map),
        other => Err(StoreError::CorruptDocument(format!(
            "document root must be an object, found {}",
            json_type(&other)
        ))),
    }
}

/// Serialize a document.
pub fn encode_document(document: &Document) -> Result<Vec<u8>> {
    serde_json::to_vec(document).map_err(Into::into)
}

fn json_type(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}
