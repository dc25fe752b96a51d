//! # meshkit-router: client-side load-balancer cache
//!
//! A [`Selector`] backed by the global router service. Routing
//! decisions are cached per service name and kept live by a
//! `SelectStream` subscription; every call outcome feeds a per-node
//! stats record that a background worker publishes and resets on an
//! interval. When the router service is absent or failing, selection
//! falls back to a blacklist selector over the raw registry.
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use std::time::Duration;
//! # use meshkit_router::{Router, RouterConfig, SelectOptions, Selector};
//! # async fn example(
//! #     registry: Arc<dyn meshkit_core::Registry>,
//! #     client: Arc<dyn meshkit_core::Client>,
//! #     api: Arc<dyn meshkit_core::RouterApi>,
//! # ) -> meshkit_types::Result<()> {
//! let router = Router::new(registry, client, Some(api), RouterConfig::default());
//! router.start()?;
//!
//! let next = router.select("greeter", SelectOptions::default()).await?;
//! let node = next.next()?;
//! # Ok(())
//! # }
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use meshkit_core::topics::STATS_TOPIC;
use meshkit_core::{Client, Context, Publication, Registry, Request, RouterApi, SelectReply};
use meshkit_types::{Error, Node, Result, Service, unix_seconds};

mod selector;
mod stats;

pub use selector::{
    Filter, Next, RegistrySelector, SelectOptions, Selector, filter_metadata, filter_version,
};
pub use stats::{Histogram, StatsMessage};

use stats::NodeStats;

/// Router subsystem configuration.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Stats publication cadence.
    pub publish_interval: Duration,
    /// Backoff before a failed `SelectStream` is reopened.
    pub stream_retry: Duration,
    /// How long the fallback selector benches a failing node.
    pub penalty: Duration,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            publish_interval: Duration::from_secs(10),
            stream_retry: Duration::from_millis(100),
            penalty: Duration::from_secs(30),
        }
    }
}

#[derive(Debug, Clone)]
struct CacheEntry {
    services: Vec<Service>,
    /// Unix seconds; `-1` keeps the entry until a stream update
    /// replaces it.
    expires: i64,
}

#[derive(Default)]
struct State {
    cache: RwLock<HashMap<String, CacheEntry>>,
    /// Keyed by node id.
    stats: RwLock<HashMap<String, NodeStats>>,
    streams: Mutex<HashMap<String, JoinHandle<()>>>,
}

/// The router subsystem.
pub struct Router {
    client: Arc<dyn Client>,
    api: Option<Arc<dyn RouterApi>>,
    fallback: RegistrySelector,
    config: RouterConfig,
    state: Arc<State>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    worker: Mutex<Option<JoinHandle<()>>>,
}

impl Router {
    pub fn new(
        registry: Arc<dyn Registry>,
        client: Arc<dyn Client>,
        api: Option<Arc<dyn RouterApi>>,
        config: RouterConfig,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        Self {
            client,
            api,
            fallback: RegistrySelector::new(registry, config.penalty),
            config,
            state: Arc::new(State::default()),
            shutdown_tx,
            shutdown_rx,
            worker: Mutex::new(None),
        }
    }

    /// Starts the stats publication worker. Idempotent.
    pub fn start(&self) -> Result<()> {
        let mut worker = self.worker.lock().unwrap();
        if worker.is_none() {
            *worker = Some(tokio::spawn(run_publisher(
                Arc::clone(&self.client),
                Arc::clone(&self.state),
                self.config.publish_interval,
                self.shutdown_rx.clone(),
            )));
        }
        Ok(())
    }

    /// Stops the publication worker and every stream subscription.
    /// Terminal: a stopped router serves no further cache refreshes.
    pub async fn stop(&self) -> Result<()> {
        let _ = self.shutdown_tx.send(true);

        let worker = self.worker.lock().unwrap().take();
        if let Some(worker) = worker {
            let _ = worker.await;
        }

        let streams: Vec<_> = {
            let mut streams = self.state.streams.lock().unwrap();
            streams.drain().map(|(_, handle)| handle).collect()
        };
        for handle in streams {
            let _ = handle.await;
        }
        Ok(())
    }

    /// Records one finished call against `node`.
    pub fn record(
        &self,
        req: &Request,
        node: &Node,
        duration: Duration,
        error: Option<&Error>,
    ) {
        let mut stats = self.state.stats.write().unwrap();
        stats
            .entry(node.id.clone())
            .or_insert_with(|| NodeStats::new(&req.service, &node.id))
            .record(&req.method, duration, error.is_some());
    }

    fn cached(&self, service: &str, options: &SelectOptions) -> Option<Next> {
        let cache = self.state.cache.read().unwrap();
        let entry = cache.get(service)?;
        if entry.expires != -1 && entry.expires <= unix_seconds() {
            return None;
        }
        let nodes: Vec<Node> = selector::apply_filters(entry.services.clone(), options)
            .into_iter()
            .flat_map(|s| s.nodes)
            .collect();
        Some(Next::new(nodes))
    }

    fn ensure_stream(&self, service: &str) {
        let Some(api) = self.api.clone() else { return };
        let mut streams = self.state.streams.lock().unwrap();
        if streams.contains_key(service) {
            return;
        }
        streams.insert(
            service.to_string(),
            tokio::spawn(run_stream(
                api,
                service.to_string(),
                Arc::clone(&self.state),
                self.config.stream_retry,
                self.shutdown_rx.clone(),
            )),
        );
    }
}

#[async_trait]
impl Selector for Router {
    /// Serves from the cache when the entry is live; otherwise asks
    /// the router service and installs the reply. With no router
    /// service, or when it fails, the registry fallback answers.
    async fn select(&self, service: &str, options: SelectOptions) -> Result<Next> {
        if let Some(next) = self.cached(service, &options) {
            return Ok(next);
        }

        let Some(api) = &self.api else {
            return self.fallback.select(service, options).await;
        };

        match api.select(service).await {
            Ok(reply) => {
                install(&self.state, service, reply);
                self.ensure_stream(service);
                self.cached(service, &options).ok_or(Error::NotAvailable)
            }
            Err(err) => {
                warn!(service = %service, error = %err, "router select failed, using fallback");
                self.fallback.select(service, options).await
            }
        }
    }

    /// Counts an error against the node's stats and feeds the fallback
    /// selector's blacklist.
    async fn mark(&self, service: &str, node: &Node, error: Option<&Error>) {
        if error.is_some() {
            let mut stats = self.state.stats.write().unwrap();
            stats
                .entry(node.id.clone())
                .or_insert_with(|| NodeStats::new(service, &node.id))
                .mark_error();
        }
        self.fallback.mark(service, node, error).await;
    }

    async fn reset(&self, service: &str) {
        {
            let mut stats = self.state.stats.write().unwrap();
            for record in stats.values_mut().filter(|r| r.service == service) {
                record.reset();
            }
        }
        self.fallback.reset(service).await;
    }

    async fn close(&self) {
        let _ = self.stop().await;
        self.fallback.close().await;
        self.state.cache.write().unwrap().clear();
        self.state.stats.write().unwrap().clear();
    }
}

/// Installs a routing reply: stats records follow the node set, then
/// the cache entry is replaced with a single assignment.
fn install(state: &State, service: &str, reply: SelectReply) {
    let node_ids: HashSet<&str> = reply
        .services
        .iter()
        .flat_map(|s| s.nodes.iter().map(|n| n.id.as_str()))
        .collect();

    {
        let mut stats = state.stats.write().unwrap();
        stats.retain(|id, record| record.service != service || node_ids.contains(id.as_str()));
        for svc in &reply.services {
            for node in &svc.nodes {
                stats
                    .entry(node.id.clone())
                    .or_insert_with(|| NodeStats::new(service, &node.id));
            }
        }
    }

    state.cache.write().unwrap().insert(
        service.to_string(),
        CacheEntry { services: reply.services, expires: reply.expires },
    );
}

/// One stream subscription: replaces the cache entry on every update,
/// backs off `retry` after a failure, reopens, and dies on shutdown.
async fn run_stream(
    api: Arc<dyn RouterApi>,
    service: String,
    state: Arc<State>,
    retry: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        if *shutdown.borrow() {
            return;
        }
        match api.select_stream(&service).await {
            Ok(mut stream) => loop {
                tokio::select! {
                    reply = stream.next() => match reply {
                        Ok(reply) => {
                            debug!(service = %service, "routing update");
                            install(&state, &service, reply);
                        }
                        Err(err) => {
                            warn!(service = %service, error = %err, "select stream failed");
                            tokio::time::sleep(retry).await;
                            break;
                        }
                    },
                    _ = shutdown.changed() => return,
                }
            },
            Err(err) => {
                warn!(service = %service, error = %err, "select stream open failed");
                tokio::select! {
                    () = tokio::time::sleep(retry) => {}
                    _ = shutdown.changed() => return,
                }
            }
        }
    }
}

async fn run_publisher(
    client: Arc<dyn Client>,
    state: Arc<State>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut tick = tokio::time::interval(interval);
    tick.tick().await;

    loop {
        tokio::select! {
            _ = tick.tick() => publish_stats(&client, &state).await,
            _ = shutdown.changed() => return,
        }
    }
}

/// Snapshots and resets every active record, then publishes the
/// batch. Reset happens synchronously under the lock, so calls
/// recorded during the publish land in the next batch; delivery
/// failures only cost the one message.
async fn publish_stats(client: &Arc<dyn Client>, state: &State) {
    let now = unix_seconds();
    let messages: Vec<StatsMessage> = {
        let mut stats = state.stats.write().unwrap();
        stats
            .values_mut()
            .filter(|record| !record.is_idle())
            .map(|record| {
                let message = record.to_message(now);
                record.reset();
                message
            })
            .collect()
    };

    for message in messages {
        match Publication::new(STATS_TOPIC, &message) {
            Ok(publication) => {
                if let Err(err) = client.publish(&Context::new(), &publication).await {
                    warn!(node = %message.node_id, error = %err, "stats publish failed");
                }
            }
            Err(err) => warn!(error = %err, "stats message failed to encode"),
        }
    }
}

#[cfg(test)]
mod tests;
