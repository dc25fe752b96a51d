//! Single-holder leader election with revocation signalling.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot};
use tracing::debug;

use meshkit_core::{CoordinationStore, LockRequest, StoreLock};
use meshkit_types::{Error, LeaderStatus, Node, Result};

/// An election seat for one leadership id.
///
/// `elect` blocks until this process is the sole holder. Status
/// transitions funnel through a single background writer, so a
/// concurrent [`status`](Leader::status) reader never observes a torn
/// state.
pub struct Leader {
    store: Arc<dyn CoordinationStore>,
    id: String,
    key: String,
    node: Node,
    status: Arc<Mutex<LeaderStatus>>,
    status_tx: mpsc::UnboundedSender<LeaderStatus>,
}

impl Leader {
    pub(crate) fn new(
        store: Arc<dyn CoordinationStore>,
        id: &str,
        key: String,
        node: Node,
    ) -> Self {
        let status = Arc::new(Mutex::new(LeaderStatus::Follower));
        let (status_tx, mut status_rx) = mpsc::unbounded_channel();

        // Single writer: every transition lands here in send order.
        let writer = Arc::clone(&status);
        tokio::spawn(async move {
            while let Some(next) = status_rx.recv().await {
                *writer.lock().unwrap() = next;
            }
        });

        Self {
            store,
            id: id.to_string(),
            key,
            node,
            status,
            status_tx,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// The node currently holding leadership, read from the store.
    pub async fn leader(&self) -> Result<Node> {
        let raw = self.store.read(&self.key).await?;
        serde_json::from_slice(&raw).map_err(Error::codec)
    }

    /// Blocks until this caller holds leadership.
    ///
    /// The store key carries this process's marshalled [`Node`] while
    /// leadership is held, which is what [`leader`](Leader::leader)
    /// reads back on any member.
    pub async fn elect(&self) -> Result<Elected> {
        let _ = self.status_tx.send(LeaderStatus::Candidate);

        let value = serde_json::to_vec(&self.node).map_err(Error::codec)?;
        let acquired = self
            .store
            .acquire(LockRequest {
                key: self.key.clone(),
                value,
                ttl: Duration::ZERO,
                // An election has no wait bound; candidates block
                // until the seat frees up.
                wait: Duration::MAX,
            })
            .await;

        let mut lock = match acquired {
            Ok(lock) => lock,
            Err(err) => {
                let _ = self.status_tx.send(LeaderStatus::Follower);
                return Err(err);
            }
        };

        let _ = self.status_tx.send(LeaderStatus::Elected);
        debug!(id = %self.id, node = %self.node.id, "elected leader");

        let (revoked_tx, revoked_rx) = oneshot::channel();
        let resigned = Arc::new(AtomicBool::new(false));

        if let Some(lost) = lock.session_lost() {
            let status_tx = self.status_tx.clone();
            let resigned = Arc::clone(&resigned);
            let id = self.id.clone();
            tokio::spawn(async move {
                // A voluntary resign drops the sender instead of
                // firing it, so `lost` resolves Err and nothing fires.
                if lost.await.is_ok() && !resigned.load(Ordering::Acquire) {
                    debug!(id = %id, "leadership revoked");
                    let _ = status_tx.send(LeaderStatus::Follower);
                    let _ = revoked_tx.send(());
                }
            });
        }

        Ok(Elected {
            lock,
            revoked: Some(revoked_rx),
            status_tx: self.status_tx.clone(),
            resigned,
        })
    }

    /// Where this process stands right now.
    pub fn status(&self) -> LeaderStatus {
        *self.status.lock().unwrap()
    }
}

/// Held leadership.
pub struct Elected {
    lock: Box<dyn StoreLock>,
    revoked: Option<oneshot::Receiver<()>>,
    status_tx: mpsc::UnboundedSender<LeaderStatus>,
    resigned: Arc<AtomicBool>,
}

impl Elected {
    /// One-shot signal fired when leadership is lost for any reason
    /// other than voluntary resignation. Yields the receiver once.
    pub fn revoked(&mut self) -> Result<oneshot::Receiver<()>> {
        self.revoked.take().ok_or(Error::NotAvailable)
    }

    /// Voluntarily surrenders leadership.
    pub async fn resign(mut self) -> Result<()> {
        self.resigned.store(true, Ordering::Release);
        let _ = self.status_tx.send(LeaderStatus::Follower);
        self.lock.release().await
    }
}
