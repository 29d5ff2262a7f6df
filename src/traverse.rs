//! Path traversal over the in-memory document.
//!
//! Traversal is strict: every consumed segment must select an existing key
//! in a JSON object. Arrays and scalars are leaves. Walking stops at the
//! first segment that does not resolve, and the remaining segments form the
//! unresolved suffix, which may not be longer than the caller's limit
//! (0 for reads and deletes, 1 for writes).
//!
//! Mutation never goes through the borrowed traversal. A traversal hands
//! out an owned [`ParentHandle`] (container path plus key), and the handle
//! is applied to a mutable document afterwards.

use serde_json::Value;

use crate::error::{Result, StoreError};
use crate::store::Document;

/// A node reached by traversal.
#[derive(Debug, Clone, Copy)]
pub enum Node<'d> {
    /// The document root.
    Root(&'d Document),
    /// A value below the root.
    Value(&'d Value),
}

impl<'d> Node<'d> {
    /// The node as a container, if it is one.
    pub fn as_container(&self) -> Option<&'d Document> {
        match *self {
            Node::Root(document) => Some(document),
            Node::Value(value) => value.as_object(),
        }
    }

    /// Clone the node into an owned JSON value.
    pub fn to_value(&self) -> Value {
        match *self {
            Node::Root(document) => Value::Object(document.clone()),
            Node::Value(value) => value.clone(),
        }
    }
}

/// Result of walking a path through a document.
#[derive(Debug, Clone)]
pub struct Traversal<'d> {
    document: &'d Document,
    path: Vec<String>,
    max_unresolved: usize,
    resolved: usize,
    current: Node<'d>,
}

/// Walk `path` through `document`, allowing at most `max_unresolved`
/// trailing segments to be missing.
pub fn traverse<'d>(
    document: &'d Document,
    path: &[String],
    max_unresolved: usize,
) -> Result<Traversal<'d>> {
    let mut current = Node::Root(document);
    let mut resolved = 0;

    for segment in path {
        match current.as_container().and_then(|c| c.get(segment)) {
            Some(child) => {
                current = Node::Value(child);
                resolved += 1;
            }
            None => break,
        }
    }

    if path.len() - resolved > max_unresolved {
        return Err(StoreError::not_found(path));
    }

    Ok(Traversal {
        document,
        path: path.to_vec(),
        max_unresolved,
        resolved,
        current,
    })
}

impl<'d> Traversal<'d> {
    /// The full requested path.
    pub fn path(&self) -> &[String] {
        &self.path
    }

    /// The deepest node reached.
    pub fn current(&self) -> Node<'d> {
        self.current
    }

    /// Trailing segments that do not exist in the document.
    pub fn unresolved(&self) -> &[String] {
        &self.path[self.resolved..]
    }

    /// True when every segment resolved.
    pub fn is_resolved(&self) -> bool {
        self.resolved == self.path.len()
    }

    /// The container `n` levels above the fully resolved path.
    pub fn walk_back(&self, n: usize) -> Result<&'d Document> {
        if n > self.resolved {
            return Err(StoreError::NotFound(format!(
                "cannot walk back {} levels from a path of depth {}",
                n, self.resolved
            )));
        }
        resolve_container(self.document, &self.path[..self.resolved - n])
    }

    /// Handle on the container that owns the final path segment.
    ///
    /// Fails with `BadRequest` for the root path and `NotFound` when the
    /// owning container does not exist or is not an object.
    pub fn parent(&self) -> Result<ParentHandle> {
        let (key, container) = self
            .path
            .split_last()
            .ok_or_else(|| StoreError::BadRequest("path has no key segment".to_string()))?;

        match self.unresolved().len() {
            0 => {
                self.walk_back(1)?;
            }
            1 => {
                if self.current.as_container().is_none() {
                    return Err(StoreError::not_found(container));
                }
            }
            _ => return Err(StoreError::not_found(&self.path)),
        }

        Ok(ParentHandle {
            container: container.to_vec(),
            key: key.clone(),
        })
    }

    /// Re-run this traversal against another (freshly loaded) document.
    pub fn refresh<'n>(&self, document: &'n Document) -> Result<Traversal<'n>> {
        traverse(document, &self.path, self.max_unresolved)
    }
}

fn resolve_container<'d>(document: &'d Document, path: &[String]) -> Result<&'d Document> {
    let mut current = document;
    for segment in path {
        current = current
            .get(segment)
            .and_then(Value::as_object)
            .ok_or_else(|| StoreError::not_found(path))?;
    }
    Ok(current)
}

/// An owned reference to "key K in container C".
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ParentHandle {
    container: Vec<String>,
    key: String,
}

impl ParentHandle {
    /// Path of the owning container.
    pub fn container_path(&self) -> &[String] {
        &self.container
    }

    /// Key inside the owning container.
    pub fn key(&self) -> &str {
        &self.key
    }

    /// Full path of the addressed key.
    pub fn path(&self) -> Vec<String> {
        let mut path = self.container.clone();
        path.push(self.key.clone());
        path
    }

    /// Resolve the owning container for mutation.
    pub fn container_mut<'d>(&self, document: &'d mut Document) -> Result<&'d mut Document> {
        let mut current = document;
        for segment in &self.container {
            current = current
                .get_mut(segment)
                .and_then(Value::as_object_mut)
                .ok_or_else(|| StoreError::not_found(&self.container))?;
        }
        Ok(current)
    }

    /// Set the key, returning the previous value if there was one.
    pub fn set(&self, document: &mut Document, value: Value) -> Result<Option<Value>> {
        let container = self.container_mut(document)?;
        Ok(container.insert(self.key.clone(), value))
    }

    /// Remove the key, returning the removed value.
    pub fn remove(&self, document: &mut Document) -> Result<Value> {
        let container = self.container_mut(document)?;
        container
            .remove(&self.key)
            .ok_or_else(|| StoreError::not_found(&self.path()))
    }
}
