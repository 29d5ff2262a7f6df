//! Mutation locks.
//!
//! Every read-modify-write cycle on the document runs while holding a
//! single store-wide exclusive lock. Acquisition is always bounded by a
//! timeout. A [`LockGuard`] should be released with [`LockGuard::release`];
//! a guard that is dropped instead (for example because the request future
//! was cancelled) releases its lock in the background.

use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, warn};

use crate::error::{Result, StoreError};

/// Something that holds a lock and knows how to give it back.
#[async_trait]
pub trait LockLease: Send + 'static {
    /// Release the lock.
    async fn release(self: Box<Self>) -> Result<()>;
}

/// Exclusive lock serializing document mutations.
#[async_trait]
pub trait MutationLock: Send + Sync {
    /// Wait up to `timeout` for the lock.
    async fn acquire(&self, timeout: Duration) -> Result<LockGuard>;
}

/// A held lock.
pub struct LockGuard {
    lease: Option<Box<dyn LockLease>>,
}

impl LockGuard {
    /// Wrap a lease.
    pub fn new(lease: impl LockLease) -> Self {
        Self {
            lease: Some(Box::new(lease)),
        }
    }

    /// Release the lock now.
    pub async fn release(mut self) -> Result<()> {
        match self.lease.take() {
            Some(lease) => lease.release().await,
            None => Ok(()),
        }
    }
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LockGuard")
            .field("held", &self.lease.is_some())
            .finish()
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let Some(lease) = self.lease.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = lease.release().await {
                        warn!("Failed to release dropped lock guard: {}", e);
                    }
                });
            }
            Err(_) => warn!("Lock guard dropped outside a runtime; lease left to expire"),
        }
    }
}

/// In-process lock backed by a tokio mutex.
#[derive(Clone, Default)]
pub struct LocalLock {
    mutex: Arc<Mutex<()>>,
}

impl LocalLock {
    /// Create an unlocked lock.
    pub fn new() -> Self {
        Self::default()
    }
}

struct LocalLease(OwnedMutexGuard<()>);

#[async_trait]
impl LockLease for LocalLease {
    async fn release(self: Box<Self>) -> Result<()> {
        drop(self.0);
        Ok(())
    }
}

#[async_trait]
impl MutationLock for LocalLock {
    async fn acquire(&self, timeout: Duration) -> Result<LockGuard> {
        match tokio::time::timeout(timeout, self.mutex.clone().lock_owned()).await {
            Ok(guard) => {
                debug!("Acquired local store lock");
                Ok(LockGuard::new(LocalLease(guard)))
            }
            Err(_) => {
                warn!("Timed out after {:?} waiting for local store lock", timeout);
                Err(StoreError::LockTimeout(timeout))
            }
        }
    }
}
