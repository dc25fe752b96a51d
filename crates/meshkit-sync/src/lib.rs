//! # meshkit-sync: distributed locks and leader election
//!
//! Two synchronous primitives over a pluggable
//! [`CoordinationStore`](meshkit_core::CoordinationStore):
//!
//! - [`Lock`] — a mutually-exclusive named lock with a bounded wait
//!   and a TTL enforced by the store
//! - [`Leader`] — single-holder leader election with revocation
//!   signalling
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use meshkit_sync::{LockConfig, Sync, SyncConfig};
//! # use meshkit_types::Node;
//! # async fn example(store: Arc<dyn meshkit_core::CoordinationStore>) -> meshkit_types::Result<()> {
//! let sync = Sync::new(store, Node::new("worker-1", "10.0.0.1:8080"), SyncConfig::default());
//!
//! let mut lock = sync.lock("migrations", LockConfig::default());
//! lock.acquire().await?;
//! // ... exclusive section ...
//! lock.release().await?;
//!
//! let leader = sync.leader("scheduler");
//! let mut elected = leader.elect().await?;
//! let revoked = elected.revoked()?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use meshkit_core::CoordinationStore;
use meshkit_types::Node;

mod leader;
mod lock;

pub use leader::{Elected, Leader};
pub use lock::Lock;

pub use meshkit_types::LeaderStatus;

/// Configuration for the sync subsystem.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Prefix for every lock and leader key.
    pub namespace: String,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            namespace: "micro/sync".to_string(),
        }
    }
}

/// Per-lock overrides. Zero durations defer to the store defaults.
#[derive(Debug, Clone, Copy, Default)]
pub struct LockConfig {
    /// How long `acquire` may block before `LockUnavailable`.
    pub wait: Duration,
    /// Bounds the lock lifetime if the holder dies.
    pub ttl: Duration,
}

/// Entry point handing out locks and elections over one store.
pub struct Sync {
    store: Arc<dyn CoordinationStore>,
    node: Node,
    config: SyncConfig,
}

impl Sync {
    pub fn new(store: Arc<dyn CoordinationStore>, node: Node, config: SyncConfig) -> Self {
        Self { store, node, config }
    }

    /// A named mutually-exclusive lock.
    pub fn lock(&self, id: &str, config: LockConfig) -> Lock {
        Lock::new(
            Arc::clone(&self.store),
            id,
            flatten_key(&self.config.namespace, "lock", id),
            config,
        )
    }

    /// A leader election seat. Must be created inside a tokio runtime:
    /// status transitions are serialised through a background writer.
    pub fn leader(&self, id: &str) -> Leader {
        Leader::new(
            Arc::clone(&self.store),
            id,
            flatten_key(&self.config.namespace, "leader", id),
            self.node.clone(),
        )
    }
}

/// Builds `<namespace>/<kind>/<id>` and flattens path separators so
/// stores with path-structured keyspaces treat it as a single segment.
fn flatten_key(namespace: &str, kind: &str, id: &str) -> String {
    format!("{namespace}/{kind}/{id}").replace('/', "#")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn keys_are_namespaced_and_flattened() {
        assert_eq!(
            flatten_key("micro/sync", "lock", "migrations"),
            "micro#sync#lock#migrations"
        );
        assert_eq!(flatten_key("ns", "leader", "a/b"), "ns#leader#a#b");
    }
}
