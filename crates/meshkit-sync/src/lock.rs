//! The mutually-exclusive named lock.

use std::sync::Arc;

use meshkit_core::{CoordinationStore, LockRequest, StoreLock};
use meshkit_types::{Error, Result};

use crate::LockConfig;

/// A handle on one named lock.
///
/// The handle is single-use: after [`release`](Lock::release) it must
/// not be used again; further calls fail with `NotAvailable`.
pub struct Lock {
    store: Arc<dyn CoordinationStore>,
    id: String,
    key: String,
    config: LockConfig,
    held: Option<Box<dyn StoreLock>>,
    released: bool,
}

impl Lock {
    pub(crate) fn new(
        store: Arc<dyn CoordinationStore>,
        id: &str,
        key: String,
        config: LockConfig,
    ) -> Self {
        Self {
            store,
            id: id.to_string(),
            key,
            config,
            held: None,
            released: false,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Blocks until the lock is held or `wait` elapses.
    ///
    /// # Errors
    ///
    /// `LockUnavailable` when the wait elapsed, `AlreadyExists` when
    /// this handle already holds the lock, `NotAvailable` on a
    /// released handle; store failures surface as `Transport`.
    pub async fn acquire(&mut self) -> Result<()> {
        if self.released {
            return Err(Error::NotAvailable);
        }
        if self.held.is_some() {
            return Err(Error::AlreadyExists);
        }

        let lock = self
            .store
            .acquire(LockRequest {
                key: self.key.clone(),
                value: Vec::new(),
                ttl: self.config.ttl,
                wait: self.config.wait,
            })
            .await?;

        self.held = Some(lock);
        Ok(())
    }

    /// Surrenders the lock and retires the handle.
    pub async fn release(&mut self) -> Result<()> {
        let mut held = self.held.take().ok_or(Error::NotAvailable)?;
        self.released = true;
        held.release().await
    }
}
