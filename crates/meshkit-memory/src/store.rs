//! An in-process coordination store.
//!
//! Locks live in a single table keyed by flattened path. A held lock
//! carries a lease; when its TTL fires before release the entry is
//! evicted and the holder's session-lost signal fires.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{broadcast, oneshot};
use tokio::time::timeout;

use meshkit_core::{CoordinationStore, LockRequest, StoreLock};
use meshkit_types::{Error, Result};

const DEFAULT_WAIT: Duration = Duration::from_secs(10);
const DEFAULT_TTL: Duration = Duration::from_secs(15);

struct Held {
    lease: u64,
    value: Vec<u8>,
    lost_tx: Option<oneshot::Sender<()>>,
}

struct Inner {
    entries: Mutex<HashMap<String, Held>>,
    /// Fires a key on every release/expiry so waiters recheck.
    released: broadcast::Sender<String>,
    leases: AtomicU64,
}

/// A coordination store backed by a process-local lock table.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Inner>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        let (released, _) = broadcast::channel(64);
        Self {
            inner: Arc::new(Inner {
                entries: Mutex::new(HashMap::new()),
                released,
                leases: AtomicU64::new(1),
            }),
        }
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Forcibly evicts a held lock, firing its session-lost signal.
    /// Simulates a store partition or session timeout in tests.
    pub fn revoke(&self, key: &str) {
        let lost = {
            let mut entries = self.inner.entries.lock().unwrap();
            entries.remove(key).and_then(|mut held| held.lost_tx.take())
        };
        if let Some(tx) = lost {
            let _ = tx.send(());
        }
        let _ = self.inner.released.send(key.to_string());
    }

    fn expire_after(&self, key: String, lease: u64, ttl: Duration) {
        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            tokio::time::sleep(ttl).await;
            let lost = {
                let mut entries = inner.entries.lock().unwrap();
                if entries.get(&key).is_some_and(|held| held.lease == lease) {
                    entries.remove(&key).and_then(|mut held| held.lost_tx.take())
                } else {
                    None
                }
            };
            if let Some(tx) = lost {
                let _ = tx.send(());
            }
            let _ = inner.released.send(key);
        });
    }
}

#[async_trait]
impl CoordinationStore for MemoryStore {
    async fn acquire(&self, request: LockRequest) -> Result<Box<dyn StoreLock>> {
        let wait = if request.wait.is_zero() { DEFAULT_WAIT } else { request.wait };
        let ttl = if request.ttl.is_zero() { DEFAULT_TTL } else { request.ttl };

        let mut released = self.inner.released.subscribe();
        let acquired = timeout(wait, async {
            loop {
                let grabbed = {
                    let mut entries = self.inner.entries.lock().unwrap();
                    if entries.contains_key(&request.key) {
                        None
                    } else {
                        let lease = self.inner.leases.fetch_add(1, Ordering::Relaxed);
                        let (lost_tx, lost_rx) = oneshot::channel();
                        entries.insert(
                            request.key.clone(),
                            Held {
                                lease,
                                value: request.value.clone(),
                                lost_tx: Some(lost_tx),
                            },
                        );
                        Some((lease, lost_rx))
                    }
                };
                if let Some(found) = grabbed {
                    return found;
                }
                // Any release wakes us for a recheck; a lagged
                // receiver rechecks just the same.
                let _ = released.recv().await;
            }
        })
        .await;

        match acquired {
            Ok((lease, lost_rx)) => {
                self.expire_after(request.key.clone(), lease, ttl);
                Ok(Box::new(MemoryLock {
                    store: self.clone(),
                    key: request.key,
                    lease,
                    lost_rx: Some(lost_rx),
                }))
            }
            Err(_) => Err(Error::LockUnavailable),
        }
    }

    async fn read(&self, key: &str) -> Result<Vec<u8>> {
        let entries = self.inner.entries.lock().unwrap();
        entries
            .get(key)
            .map(|held| held.value.clone())
            .ok_or(Error::NotFound)
    }
}

struct MemoryLock {
    store: MemoryStore,
    key: String,
    lease: u64,
    lost_rx: Option<oneshot::Receiver<()>>,
}

#[async_trait]
impl StoreLock for MemoryLock {
    fn session_lost(&mut self) -> Option<oneshot::Receiver<()>> {
        self.lost_rx.take()
    }

    async fn release(&mut self) -> Result<()> {
        {
            let mut entries = self.store.inner.entries.lock().unwrap();
            // Drops lost_tx without firing: a voluntary release is not
            // a lost session.
            if entries.get(&self.key).is_some_and(|held| held.lease == self.lease) {
                entries.remove(&self.key);
            }
        }
        let _ = self.store.inner.released.send(self.key.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(key: &str, wait: Duration, ttl: Duration) -> LockRequest {
        LockRequest {
            key: key.into(),
            value: b"holder".to_vec(),
            ttl,
            wait,
        }
    }

    #[tokio::test]
    async fn contended_acquire_times_out() {
        let store = MemoryStore::new();
        let _held = store
            .acquire(request("k", Duration::from_secs(1), Duration::ZERO))
            .await
            .unwrap();

        let err = store
            .acquire(request("k", Duration::from_millis(50), Duration::ZERO))
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::LockUnavailable));
    }

    #[tokio::test]
    async fn release_hands_over_to_waiter() {
        let store = MemoryStore::new();
        let mut held = store
            .acquire(request("k", Duration::from_secs(1), Duration::ZERO))
            .await
            .unwrap();

        let waiter = {
            let store = store.clone();
            tokio::spawn(async move {
                store
                    .acquire(request("k", Duration::from_secs(2), Duration::ZERO))
                    .await
            })
        };

        tokio::task::yield_now().await;
        held.release().await.unwrap();
        assert!(waiter.await.unwrap().is_ok());
    }

    #[tokio::test]
    async fn ttl_expiry_fires_session_lost() {
        let store = MemoryStore::new();
        let mut held = store
            .acquire(request("k", Duration::from_secs(1), Duration::from_millis(20)))
            .await
            .unwrap();

        let lost = held.session_lost().unwrap();
        timeout(Duration::from_secs(1), lost)
            .await
            .expect("ttl should fire within a second")
            .expect("sender must fire, not drop");

        // Key is free again after expiry.
        assert!(
            store
                .acquire(request("k", Duration::from_millis(100), Duration::ZERO))
                .await
                .is_ok()
        );
    }

    #[tokio::test]
    async fn voluntary_release_does_not_fire_session_lost() {
        let store = MemoryStore::new();
        let mut held = store
            .acquire(request("k", Duration::from_secs(1), Duration::ZERO))
            .await
            .unwrap();

        let lost = held.session_lost().unwrap();
        held.release().await.unwrap();

        // The sender is dropped, not fired.
        assert!(lost.await.is_err());
    }

    #[tokio::test]
    async fn read_returns_held_value() {
        let store = MemoryStore::new();
        let _held = store
            .acquire(request("leader", Duration::from_secs(1), Duration::ZERO))
            .await
            .unwrap();

        assert_eq!(store.read("leader").await.unwrap(), b"holder".to_vec());
        assert!(matches!(store.read("nope").await, Err(Error::NotFound)));
    }
}
