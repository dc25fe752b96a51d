//! # meshkit-discovery: registry cache with heartbeats
//!
//! An eventually-consistent view of a service registry. A background
//! worker folds watch events into a local cache and publishes a
//! heartbeat for every locally registered node on each tick; the
//! synchronous surface reads the cache and falls back to the registry
//! (or a discovery RPC) on a miss.
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use meshkit_discovery::{Discovery, DiscoveryConfig};
//! # use meshkit_core::Registry;
//! # async fn example(
//! #     registry: Arc<dyn meshkit_core::Registry>,
//! #     client: Arc<dyn meshkit_core::Client>,
//! # ) -> meshkit_types::Result<()> {
//! let discovery = Arc::new(Discovery::new(registry, client, DiscoveryConfig::default()));
//! discovery.start().await?;
//! let services = discovery.get_service("greeter").await?;
//! discovery.stop().await?;
//! # Ok(())
//! # }
//! ```

use std::collections::HashMap;
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use meshkit_core::topics::{HEARTBEAT_TOPIC, WATCH_TOPIC};
use meshkit_core::{Client, Context, Publication, Registry, Request, Watcher};
use meshkit_types::{
    Heartbeat, Result, Service, WatchAction, WatchEvent, unix_seconds,
};

mod cache;

/// The service name answering discovery RPCs when
/// [`DiscoveryConfig::discovery_enabled`] is set.
const DISCOVERY_SERVICE: &str = "go.micro.srv.discovery";

/// Discovery subsystem configuration.
#[derive(Debug, Clone)]
pub struct DiscoveryConfig {
    /// Heartbeat publication cadence.
    pub interval: Duration,
    /// Route cache misses to the discovery RPC instead of the
    /// registry collaborator.
    pub discovery_enabled: bool,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(30),
            discovery_enabled: false,
        }
    }
}

#[derive(Default)]
struct State {
    cache: RwLock<HashMap<String, Vec<Service>>>,
    heartbeats: RwLock<HashMap<String, Heartbeat>>,
}

/// A registry-fronting cache.
pub struct Discovery {
    registry: Arc<dyn Registry>,
    client: Arc<dyn Client>,
    config: DiscoveryConfig,
    state: Arc<State>,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Discovery {
    pub fn new(
        registry: Arc<dyn Registry>,
        client: Arc<dyn Client>,
        config: DiscoveryConfig,
    ) -> Self {
        Self {
            registry,
            client,
            config,
            state: Arc::new(State::default()),
            shutdown: Mutex::new(None),
            worker: Mutex::new(None),
        }
    }

    /// Opens the watch stream and starts the reconciliation/heartbeat
    /// worker. Idempotent.
    pub async fn start(&self) -> Result<()> {
        if self.shutdown.lock().unwrap().is_some() {
            return Ok(());
        }

        let watcher = self.registry.watch().await?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let handle = tokio::spawn(run(
            Arc::clone(&self.state),
            Arc::clone(&self.registry),
            Arc::clone(&self.client),
            self.config.interval,
            watcher,
            shutdown_rx,
        ));

        *self.shutdown.lock().unwrap() = Some(shutdown_tx);
        *self.worker.lock().unwrap() = Some(handle);
        Ok(())
    }

    /// Stops the worker. Idempotent; in-flight facade calls are not
    /// cancelled.
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

    /// Stops the worker and drops all cached state.
    pub async fn close(&self) -> Result<()> {
        self.stop().await?;
        self.state.cache.write().unwrap().clear();
        self.state.heartbeats.write().unwrap().clear();
        Ok(())
    }

    fn record_heartbeat(&self, service: &Service) {
        if let Some(node) = service.nodes.first() {
            let interval = self.config.interval.as_secs() as i64;
            let heartbeat = Heartbeat {
                service: service.clone(),
                interval_secs: interval,
                ttl_secs: interval * 2,
                timestamp: unix_seconds(),
            };
            self.state
                .heartbeats
                .write()
                .unwrap()
                .insert(node.id.clone(), heartbeat);
        }
    }

    fn drop_heartbeat(&self, service: &Service) {
        if let Some(node) = service.nodes.first() {
            self.state.heartbeats.write().unwrap().remove(&node.id);
        }
    }

    async fn announce(&self, action: WatchAction, service: &Service) {
        let event = WatchEvent::new(action, service.clone());
        match Publication::new(WATCH_TOPIC, &event) {
            Ok(publication) => {
                if let Err(err) = self.client.publish(&Context::new(), &publication).await {
                    warn!(service = %service.name, error = %err, "watch event publish failed");
                }
            }
            Err(err) => warn!(error = %err, "watch event failed to encode"),
        }
    }
}

#[async_trait]
impl Registry for Discovery {
    /// Registers with the underlying registry, records a heartbeat for
    /// the service's first node and mirrors an `update` event onto the
    /// watch topic.
    async fn register(&self, service: &Service) -> Result<()> {
        self.registry.register(service).await?;
        self.record_heartbeat(service);
        self.announce(WatchAction::Update, service).await;
        Ok(())
    }

    async fn deregister(&self, service: &Service) -> Result<()> {
        self.registry.deregister(service).await?;
        self.drop_heartbeat(service);
        self.announce(WatchAction::Delete, service).await;
        Ok(())
    }

    /// Serves from the cache when possible, otherwise asks the
    /// discovery service (when enabled) or the registry.
    async fn get_service(&self, name: &str) -> Result<Vec<Service>> {
        {
            let cache = self.state.cache.read().unwrap();
            if let Some(services) = cache.get(name) {
                return Ok(services.clone());
            }
        }

        if self.config.discovery_enabled {
            let req = Request::new(
                DISCOVERY_SERVICE,
                "Discovery.GetService",
                &serde_json::json!({ "service": name }),
            )?;
            let body = self.client.call(&Context::new(), &req).await?;
            return meshkit_core::codec::decode(body);
        }

        self.registry.get_service(name).await
    }

    async fn list_services(&self) -> Result<Vec<Service>> {
        {
            let cache = self.state.cache.read().unwrap();
            if !cache.is_empty() {
                return Ok(cache.values().flatten().cloned().collect());
            }
        }
        self.registry.list_services().await
    }

    async fn watch(&self) -> Result<Box<dyn Watcher>> {
        self.registry.watch().await
    }
}

/// The background worker: reconciles watch events and publishes
/// heartbeats until stopped. A failed watcher is reopened once per
/// incident; a failure of the reopened stream ends the loop.
async fn run(
    state: Arc<State>,
    registry: Arc<dyn Registry>,
    client: Arc<dyn Client>,
    interval: Duration,
    mut watcher: Box<dyn Watcher>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut tick = tokio::time::interval(interval);
    tick.tick().await;
    let mut reopened = false;

    loop {
        tokio::select! {
            event = watcher.next() => match event {
                Ok(event) => {
                    reopened = false;
                    debug!(action = %event.action, service = %event.service.name, "watch event");
                    let mut cache = state.cache.write().unwrap();
                    cache::apply(&mut cache, &event);
                }
                Err(err) => {
                    warn!(error = %err, "watcher failed");
                    if reopened {
                        return;
                    }
                    match registry.watch().await {
                        Ok(next) => {
                            watcher = next;
                            reopened = true;
                        }
                        Err(err) => {
                            warn!(error = %err, "watcher reopen failed, leaving loop");
                            return;
                        }
                    }
                }
            },
            _ = tick.tick() => publish_heartbeats(&state, &client).await,
            _ = shutdown.changed() => {
                watcher.stop();
                return;
            }
        }
    }
}

async fn publish_heartbeats(state: &State, client: &Arc<dyn Client>) {
    let beats: Vec<Heartbeat> = {
        let mut heartbeats = state.heartbeats.write().unwrap();
        let now = unix_seconds();
        heartbeats
            .values_mut()
            .map(|hb| {
                hb.timestamp = now;
                hb.clone()
            })
            .collect()
    };

    for heartbeat in beats {
        match Publication::new(HEARTBEAT_TOPIC, &heartbeat) {
            Ok(publication) => {
                if let Err(err) = client.publish(&Context::new(), &publication).await {
                    warn!(
                        service = %heartbeat.service.name,
                        error = %err,
                        "heartbeat publish failed"
                    );
                }
            }
            Err(err) => warn!(error = %err, "heartbeat failed to encode"),
        }
    }
}
