//! # meshkit-kv: consistent-hash key/value ring
//!
//! A peer-to-peer KV layered over the process mesh. Every participant
//! announces itself on a gossip topic; the announcement set forms a
//! consistent-hash ring, keys map to `replicas` ring members, and each
//! member stores its slice in an in-process map served over `KV.*`
//! RPCs. A reaper drops members that stop gossiping and purges
//! expired items.
//!
//! Alternatively, `use_service_mode` delegates every operation to a
//! central KV service.
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use meshkit_kv::{Kv, KvConfig};
//! # use meshkit_types::Item;
//! # async fn example(
//! #     client: Arc<dyn meshkit_core::Client>,
//! #     server: Arc<dyn meshkit_core::Server>,
//! # ) -> meshkit_types::Result<()> {
//! let kv = Kv::new(client, server, KvConfig::default());
//! kv.start().await?;
//! kv.put(&Item::new("greeting", &b"hello"[..])).await?;
//! let item = kv.get("greeting").await?;
//! # Ok(())
//! # }
//! ```

use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use meshkit_core::topics::GOSSIP_TOPIC;
use meshkit_core::{Client, Context, Publication, Request, Server, Subscriber, codec};
use meshkit_types::identity::advertise_address;
use meshkit_types::{Announcement, Error, Item, Node, Result, unix_seconds};

mod ring;
mod store;

use ring::Ring;
use store::{
    DelRequest, DelResponse, GetRequest, GetResponse, PutRequest, PutResponse, Store,
    StoreHandler, WireItem,
};

/// The service name KV RPCs are addressed to in service mode.
const KV_SERVICE: &str = "go.micro.kv";

/// How long the bootstrap retries resolving the advertise address.
const BOOTSTRAP_ATTEMPTS: u32 = 10;
const BOOTSTRAP_BACKOFF: Duration = Duration::from_millis(100);

/// KV subsystem configuration.
#[derive(Debug, Clone)]
pub struct KvConfig {
    /// Ring partition label; announcements from other namespaces are
    /// ignored.
    pub namespace: String,
    /// Ring members each key is stored on.
    pub replicas: usize,
    /// Replicas that must accept a put before it counts as stored.
    pub write_quorum: usize,
    /// Delegate every operation to the central KV service instead of
    /// running a ring.
    pub use_service_mode: bool,
    pub gossip_interval: Duration,
    pub reaper_interval: Duration,
    /// Virtual nodes per ring member.
    pub vnodes: usize,
}

impl Default for KvConfig {
    fn default() -> Self {
        Self {
            namespace: "global".to_string(),
            replicas: 1,
            write_quorum: 1,
            use_service_mode: false,
            gossip_interval: Duration::from_secs(1),
            reaper_interval: Duration::from_secs(10),
            vnodes: ring::DEFAULT_VNODES,
        }
    }
}

/// The KV subsystem.
pub struct Kv {
    client: Arc<dyn Client>,
    server: Arc<dyn Server>,
    config: KvConfig,
    ring: Arc<RwLock<Ring>>,
    store: Arc<Store>,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Kv {
    pub fn new(client: Arc<dyn Client>, server: Arc<dyn Server>, config: KvConfig) -> Self {
        let vnodes = config.vnodes;
        Self {
            client,
            server,
            config,
            ring: Arc::new(RwLock::new(Ring::new(vnodes))),
            store: Arc::new(Store::new()),
            shutdown: Mutex::new(None),
            worker: Mutex::new(None),
        }
    }

    /// Registers the storage handler and gossip subscriber, bootstraps
    /// the local address into the ring and starts the gossip/reaper
    /// worker. Idempotent. A no-op in service mode.
    pub async fn start(&self) -> Result<()> {
        if self.config.use_service_mode {
            return Ok(());
        }
        if self.shutdown.lock().unwrap().is_some() {
            return Ok(());
        }

        self.server
            .handle("KV", Arc::new(StoreHandler { store: Arc::clone(&self.store) }))
            .await?;
        self.server
            .subscribe(
                GOSSIP_TOPIC,
                Arc::new(GossipSubscriber {
                    ring: Arc::clone(&self.ring),
                    namespace: self.config.namespace.clone(),
                }),
            )
            .await?;

        // The local node joins its own ring as soon as its address is
        // known; peers only learn of it through gossip.
        let address = self.resolve_address().await?;
        self.ring.write().unwrap().upsert(&address, unix_seconds());

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let handle = tokio::spawn(run(
            Arc::clone(&self.client),
            self.config.clone(),
            Arc::clone(&self.ring),
            Arc::clone(&self.store),
            address,
            shutdown_rx,
        ));

        *self.shutdown.lock().unwrap() = Some(shutdown_tx);
        *self.worker.lock().unwrap() = Some(handle);
        Ok(())
    }

    /// Stops the gossip/reaper worker. Idempotent.
    pub async fn stop(&self) -> Result<()> {
        let shutdown = self.shutdown.lock().unwrap().take();
        if let Some(shutdown) = shutdown {
            let _ = shutdown.send(true);
        }
        let worker = self.worker.lock().unwrap().take();
        if let Some(worker) = worker {
            let _ = worker.await;
        }
        Ok(())
    }

    /// Reads `key` from its replica set, first hit wins.
    ///
    /// # Errors
    ///
    /// `NotFound` when every replica missed or failed.
    pub async fn get(&self, key: &str) -> Result<Item> {
        if self.config.use_service_mode {
            let req = Request::new(KV_SERVICE, "KV.Get", &GetRequest { key: key.to_string() })?;
            let rsp: GetResponse = codec::decode(self.client.call(&Context::new(), &req).await?)?;
            return rsp.item.map(into_item).ok_or(Error::NotFound);
        }

        let req = Request::new(KV_SERVICE, "KV.Get", &GetRequest { key: key.to_string() })?;
        for node in self.replica_nodes(key) {
            match self.client.call_remote(&Context::new(), &node, &req).await {
                Ok(body) => {
                    let rsp: GetResponse = codec::decode(body)?;
                    if let Some(item) = rsp.item {
                        return Ok(into_item(item));
                    }
                }
                Err(err) => {
                    debug!(node = %node.address, error = %err, "replica get failed");
                }
            }
        }
        Err(Error::NotFound)
    }

    /// Stores `item` on its replica set.
    ///
    /// Best-effort: the put counts as stored once `write_quorum`
    /// replicas accept it; otherwise the last replica failure is
    /// returned.
    pub async fn put(&self, item: &Item) -> Result<()> {
        let wire = from_item(item);
        if self.config.use_service_mode {
            let req = Request::new(KV_SERVICE, "KV.Put", &PutRequest { item: wire })?;
            let _: PutResponse = codec::decode(self.client.call(&Context::new(), &req).await?)?;
            return Ok(());
        }

        let req = Request::new(KV_SERVICE, "KV.Put", &PutRequest { item: wire })?;
        let nodes = self.replica_nodes(&item.key);
        if nodes.is_empty() {
            return Err(Error::NotAvailable);
        }

        let quorum = self.config.write_quorum.clamp(1, nodes.len());
        let mut accepted = 0usize;
        let mut last_err = None;

        for node in nodes {
            match self.client.call_remote(&Context::new(), &node, &req).await {
                Ok(_) => accepted += 1,
                Err(err) => {
                    debug!(node = %node.address, error = %err, "replica put failed");
                    last_err = Some(err);
                }
            }
        }

        if accepted >= quorum {
            Ok(())
        } else {
            Err(last_err.unwrap_or(Error::NotAvailable))
        }
    }

    /// Best-effort broadcast delete across the replica set; the last
    /// failure, if any, is returned.
    pub async fn del(&self, key: &str) -> Result<()> {
        if self.config.use_service_mode {
            let req = Request::new(KV_SERVICE, "KV.Del", &DelRequest { key: key.to_string() })?;
            let _: DelResponse = codec::decode(self.client.call(&Context::new(), &req).await?)?;
            return Ok(());
        }

        let req = Request::new(KV_SERVICE, "KV.Del", &DelRequest { key: key.to_string() })?;
        let mut last_err = None;
        for node in self.replica_nodes(key) {
            if let Err(err) = self.client.call_remote(&Context::new(), &node, &req).await {
                debug!(node = %node.address, error = %err, "replica del failed");
                last_err = Some(err);
            }
        }
        match last_err {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn replica_nodes(&self, key: &str) -> Vec<Node> {
        let ring = self.ring.read().unwrap();
        ring.get_n(key, self.config.replicas)
            .into_iter()
            .map(|address| Node::new(address.clone(), address))
            .collect()
    }

    async fn resolve_address(&self) -> Result<String> {
        for _ in 0..BOOTSTRAP_ATTEMPTS {
            let options = self.server.options();
            match advertise_address(&options.advertise, &options.address) {
                Ok(address) => return Ok(address),
                Err(_) => tokio::time::sleep(BOOTSTRAP_BACKOFF).await,
            }
        }
        warn!("no advertise address after bootstrap retries");
        Err(Error::NotAvailable)
    }
}

fn into_item(wire: WireItem) -> Item {
    Item {
        key: wire.key,
        value: wire.value.into(),
        expiration: Duration::from_secs(wire.expiration.max(0) as u64),
    }
}

fn from_item(item: &Item) -> WireItem {
    WireItem {
        key: item.key.clone(),
        value: item.value.to_vec(),
        expiration: item.expiration.as_secs() as i64,
    }
}

/// Folds gossip announcements for the local namespace into the ring.
struct GossipSubscriber {
    ring: Arc<RwLock<Ring>>,
    namespace: String,
}

#[async_trait]
impl Subscriber for GossipSubscriber {
    async fn handle(&self, _ctx: &Context, body: Value) -> Result<()> {
        let announcement: Announcement = codec::decode(body)?;
        if announcement.namespace != self.namespace {
            return Ok(());
        }
        self.ring
            .write()
            .unwrap()
            .upsert(&announcement.address, announcement.timestamp);
        Ok(())
    }
}

/// Gossip and reaper ticks until stopped.
async fn run(
    client: Arc<dyn Client>,
    config: KvConfig,
    ring: Arc<RwLock<Ring>>,
    store: Arc<Store>,
    address: String,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut gossip = tokio::time::interval(config.gossip_interval);
    let mut reaper = tokio::time::interval(config.reaper_interval);

    loop {
        tokio::select! {
            _ = gossip.tick() => {
                let now = unix_seconds();
                // Keep the local member fresh even when the loopback
                // of our own announcement is delayed or lost.
                ring.write().unwrap().upsert(&address, now);

                let announcement = Announcement {
                    namespace: config.namespace.clone(),
                    address: address.clone(),
                    timestamp: now,
                };
                match Publication::new(GOSSIP_TOPIC, &announcement) {
                    Ok(publication) => {
                        if let Err(err) = client.publish(&Context::new(), &publication).await {
                            warn!(error = %err, "gossip publish failed");
                        }
                    }
                    Err(err) => warn!(error = %err, "announcement failed to encode"),
                }
            }
            _ = reaper.tick() => reap(&ring, &store, config.gossip_interval),
            _ = shutdown.changed() => {
                debug!("kv worker stopped");
                return;
            }
        }
    }
}

/// Evicts ring members that stopped gossiping and purges expired
/// items.
fn reap(ring: &RwLock<Ring>, store: &Store, gossip_interval: Duration) {
    let now = unix_seconds();
    let max_age = (gossip_interval.as_secs_f64() * 1.5) as i64;

    {
        let mut ring = ring.write().unwrap();
        for address in ring.stale(now, max_age) {
            debug!(member = %address, "reaping silent ring member");
            ring.remove(&address);
        }
    }

    store.purge_expired(now);
}
