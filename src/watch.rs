//! Change notifications for committed mutations.
//!
//! Events are published only after the mutated document has been saved.
//! Notifications are in-process only.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::pin::Pin;
use std::task::{Context, Poll};
use tokio::sync::broadcast;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::Stream;

/// What a committed mutation did to its key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventType {
    /// PUT added a key that was absent.
    Created,
    /// PUT replaced an existing value.
    Updated,
    /// DELETE removed the key.
    Deleted,
}

/// A committed change to one key of the document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchEvent {
    /// Slash-delimited path of the key that changed.
    pub path: String,
    /// Whether the key was created, overwritten or removed.
    pub event_type: EventType,
    /// Value before the mutation, absent for `Created`.
    pub old_value: Option<Value>,
    /// Value after the mutation, absent for `Deleted`.
    pub new_value: Option<Value>,
}

impl WatchEvent {
    /// Event for a written key; `old_value` decides between created and updated.
    pub fn written(path: impl Into<String>, old_value: Option<Value>, new_value: Value) -> Self {
        let event_type = if old_value.is_some() {
            EventType::Updated
        } else {
            EventType::Created
        };
        Self {
            path: path.into(),
            event_type,
            old_value,
            new_value: Some(new_value),
        }
    }

    /// Event for a deleted key.
    pub fn deleted(path: impl Into<String>, old_value: Value) -> Self {
        Self {
            path: path.into(),
            event_type: EventType::Deleted,
            old_value: Some(old_value),
            new_value: None,
        }
    }
}

/// Committed events whose path matches a pattern.
///
/// The pattern is an exact path, or a prefix followed by `*`.
pub struct WatchStream {
    inner: BroadcastStream<WatchEvent>,
    pattern: String,
}

impl WatchStream {
    fn new(receiver: broadcast::Receiver<WatchEvent>, pattern: impl Into<String>) -> Self {
        Self {
            inner: BroadcastStream::new(receiver),
            pattern: pattern.into(),
        }
    }

    /// Pattern given at subscription.
    pub fn pattern(&self) -> &str {
        &self.pattern
    }

    fn matches(&self, path: &str) -> bool {
        match self.pattern.strip_suffix('*') {
            Some(prefix) => path.starts_with(prefix),
            None => path == self.pattern,
        }
    }
}

impl Stream for WatchStream {
    type Item = WatchEvent;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        loop {
            match Pin::new(&mut self.inner).poll_next(cx) {
                Poll::Ready(Some(Ok(event))) => {
                    if self.matches(&event.path) {
                        return Poll::Ready(Some(event));
                    }
                }
                // Slow subscribers skip what they missed.
                Poll::Ready(Some(Err(BroadcastStreamRecvError::Lagged(_)))) => continue,
                Poll::Ready(None) => return Poll::Ready(None),
                Poll::Pending => return Poll::Pending,
            }
        }
    }
}

/// Publishing side of the event channel, owned by the store.
#[derive(Clone)]
pub struct WatchSender {
    sender: broadcast::Sender<WatchEvent>,
}

impl WatchSender {
    /// `capacity` bounds how far a subscriber may lag before events are dropped.
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Publish `event` to every live subscriber.
    pub fn send(&self, event: WatchEvent) {
        // No subscribers is not an error.
        let _ = self.sender.send(event);
    }

    /// New stream receiving events published from now on.
    pub fn subscribe(&self, pattern: impl Into<String>) -> WatchStream {
        WatchStream::new(self.sender.subscribe(), pattern)
    }

    /// Number of live subscribers.
    pub fn receiver_count(&self) -> usize {
        self.sender.receiver_count()
    }
}

impl Default for WatchSender {
    fn default() -> Self {
        Self::new(1024)
    }
}
