//! # meshkit
//!
//! A client-side microservices platform: the in-process subsystems a
//! service embeds to participate in a distributed fleet.
//!
//! - [`discovery`] — registry cache with watch reconciliation and
//!   heartbeats
//! - [`kv`] — gossip-announced consistent-hash key/value ring
//! - [`router`] — load-balancer cache with per-node call stats
//! - [`trace`] — batched span pipeline with header propagation
//! - [`sync`] — distributed locks and leader election
//!
//! Every subsystem takes its collaborators (registry, transport,
//! coordination store) as injected [`core`] trait objects; [`Platform`]
//! bundles one set of collaborators and hands out subsystems wired to
//! them.
//!
//! ```no_run
//! use meshkit::Platform;
//! use meshkit::discovery::DiscoveryConfig;
//! use meshkit::types::{Node, Service};
//!
//! # async fn example() -> meshkit::types::Result<()> {
//! // In-process collaborators, good for tests and single-binary runs.
//! let platform = Platform::local("demo");
//!
//! let discovery = platform.discovery(DiscoveryConfig::default())?;
//! discovery.start().await?;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use meshkit_core::{Client, CoordinationStore, Registry, RouterApi, Server};
use meshkit_discovery::{Discovery, DiscoveryConfig};
use meshkit_kv::{Kv, KvConfig};
use meshkit_memory::{MemoryMesh, MemoryRegistry, MemoryStore};
use meshkit_router::{Router, RouterConfig};
use meshkit_sync::{Sync, SyncConfig};
use meshkit_trace::{Trace, TraceConfig};
use meshkit_types::identity::node_id;
use meshkit_types::{Error, Node, Result};

pub use meshkit_core as core;
pub use meshkit_discovery as discovery;
pub use meshkit_kv as kv;
pub use meshkit_memory as memory;
pub use meshkit_router as router;
pub use meshkit_sync as sync;
pub use meshkit_trace as trace;
pub use meshkit_types as types;

/// One set of collaborators, wired into subsystems on demand.
///
/// Collaborators a deployment does not provide simply gate the
/// subsystems that need them: asking for one then fails with
/// `NotAvailable`.
#[derive(Default)]
pub struct Platform {
    registry: Option<Arc<dyn Registry>>,
    client: Option<Arc<dyn Client>>,
    server: Option<Arc<dyn Server>>,
    store: Option<Arc<dyn CoordinationStore>>,
    router_api: Option<Arc<dyn RouterApi>>,
    node: Option<Node>,
}

impl Platform {
    pub fn new() -> Self {
        Self::default()
    }

    /// A platform over in-process collaborators: memory registry,
    /// memory transport mesh, memory coordination store.
    pub fn local(name: &str) -> Self {
        let mesh = MemoryMesh::new();
        let id = node_id(name);
        let transport = mesh.join(meshkit_core::ServerOptions {
            name: name.to_string(),
            id: id.clone(),
            address: "127.0.0.1:9090".to_string(),
            ..meshkit_core::ServerOptions::default()
        });

        Self::new()
            .with_registry(Arc::new(MemoryRegistry::new()))
            .with_client(Arc::new(transport.clone()))
            .with_server(Arc::new(transport))
            .with_store(Arc::new(MemoryStore::new()))
            .with_node(Node::new(id, "127.0.0.1:9090"))
    }

    pub fn with_registry(mut self, registry: Arc<dyn Registry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub fn with_client(mut self, client: Arc<dyn Client>) -> Self {
        self.client = Some(client);
        self
    }

    pub fn with_server(mut self, server: Arc<dyn Server>) -> Self {
        self.server = Some(server);
        self
    }

    pub fn with_store(mut self, store: Arc<dyn CoordinationStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_router_api(mut self, api: Arc<dyn RouterApi>) -> Self {
        self.router_api = Some(api);
        self
    }

    /// The identity this process presents in elections.
    pub fn with_node(mut self, node: Node) -> Self {
        self.node = Some(node);
        self
    }

    pub fn discovery(&self, config: DiscoveryConfig) -> Result<Discovery> {
        Ok(Discovery::new(
            self.registry()?,
            self.client()?,
            config,
        ))
    }

    pub fn kv(&self, config: KvConfig) -> Result<Kv> {
        Ok(Kv::new(self.client()?, self.server()?, config))
    }

    pub fn router(&self, config: RouterConfig) -> Result<Router> {
        Ok(Router::new(
            self.registry()?,
            self.client()?,
            self.router_api.clone(),
            config,
        ))
    }

    pub fn trace(&self, config: TraceConfig) -> Result<Trace> {
        Ok(Trace::new(self.client()?, config))
    }

    pub fn sync(&self, config: SyncConfig) -> Result<Sync> {
        let node = self.node.clone().ok_or(Error::NotAvailable)?;
        Ok(Sync::new(self.store()?, node, config))
    }

    fn registry(&self) -> Result<Arc<dyn Registry>> {
        self.registry.clone().ok_or(Error::NotAvailable)
    }

    fn client(&self) -> Result<Arc<dyn Client>> {
        self.client.clone().ok_or(Error::NotAvailable)
    }

    fn server(&self) -> Result<Arc<dyn Server>> {
        self.server.clone().ok_or(Error::NotAvailable)
    }

    fn store(&self) -> Result<Arc<dyn CoordinationStore>> {
        self.store.clone().ok_or(Error::NotAvailable)
    }
}
