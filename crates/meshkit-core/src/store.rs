//! The coordination-store capability backing locks and elections.

use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::oneshot;

use meshkit_types::Result;

/// Parameters for acquiring a named lock in the store.
#[derive(Debug, Clone)]
pub struct LockRequest {
    /// Store key; callers namespace it before it gets here.
    pub key: String,
    /// Opaque value installed while the lock is held (the leader
    /// election stores the holder's marshalled node here).
    pub value: Vec<u8>,
    /// Bounds the lock lifetime if the holder dies; enforced by the
    /// store. Zero means the store default.
    pub ttl: Duration,
    /// How long `acquire` may block before failing with
    /// `LockUnavailable`. Zero means the store default.
    pub wait: Duration,
}

/// A distributed coordination store (consul, etcd, an in-process fake).
#[async_trait]
pub trait CoordinationStore: Send + Sync {
    /// Blocks until the lock is held or `wait` elapses.
    ///
    /// # Errors
    ///
    /// `LockUnavailable` when the wait elapsed; `Transport` for store
    /// failures.
    async fn acquire(&self, request: LockRequest) -> Result<Box<dyn StoreLock>>;

    /// Reads the value currently installed at `key`.
    async fn read(&self, key: &str) -> Result<Vec<u8>>;
}

/// A held lock.
#[async_trait]
pub trait StoreLock: Send + Sync {
    /// One-shot signal fired if the backing session is lost while the
    /// lock is held (TTL expiry, store partition). Yields the receiver
    /// once; later calls return `None`. A voluntary
    /// [`release`](StoreLock::release) drops the sender without firing.
    fn session_lost(&mut self) -> Option<oneshot::Receiver<()>>;

    /// Surrenders the lock.
    async fn release(&mut self) -> Result<()>;
}
