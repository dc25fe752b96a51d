//! An in-process client/server mesh.
//!
//! Transports join a [`MemoryMesh`] under their advertised address.
//! Calls route to the transport holding the named handler,
//! publications fan out inline to every topic subscriber in the mesh.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde_json::Value;

use meshkit_core::{
    Client, Context, Publication, Request, RpcHandler, Server, ServerOptions, Subscriber,
};
use meshkit_types::{Error, Node, Result};

#[derive(Default)]
struct MeshInner {
    nodes: Mutex<HashMap<String, Arc<TransportInner>>>,
    topics: Mutex<HashMap<String, Vec<Arc<dyn Subscriber>>>>,
    /// Every publication that went through the mesh, kept for
    /// test assertions.
    published: Mutex<Vec<Publication>>,
}

/// The hub all in-process transports hang off.
#[derive(Clone, Default)]
pub struct MemoryMesh {
    inner: Arc<MeshInner>,
}

impl MemoryMesh {
    pub fn new() -> Self {
        Self::default()
    }

    /// Joins a transport to the mesh under `options.address`.
    pub fn join(&self, options: ServerOptions) -> MemoryTransport {
        let inner = Arc::new(TransportInner {
            options,
            handlers: Mutex::new(HashMap::new()),
        });
        self.inner
            .nodes
            .lock()
            .unwrap()
            .insert(inner.options.address.clone(), Arc::clone(&inner));
        MemoryTransport {
            mesh: Arc::clone(&self.inner),
            inner,
        }
    }

    /// Removes a transport from the mesh, severing its routes.
    pub fn part(&self, address: &str) {
        self.inner.nodes.lock().unwrap().remove(address);
    }

    /// Bodies published to `topic`, oldest first.
    pub fn published(&self, topic: &str) -> Vec<Value> {
        self.inner
            .published
            .lock()
            .unwrap()
            .iter()
            .filter(|p| p.topic == topic)
            .map(|p| p.body.clone())
            .collect()
    }
}

struct TransportInner {
    options: ServerOptions,
    handlers: Mutex<HashMap<String, Arc<dyn RpcHandler>>>,
}

impl TransportInner {
    async fn dispatch(&self, ctx: &Context, req: &Request) -> Result<Value> {
        let (name, method) = req
            .method
            .split_once('.')
            .ok_or_else(|| Error::Transport(format!("malformed method {}", req.method)))?;
        let handler = {
            let handlers = self.handlers.lock().unwrap();
            handlers.get(name).cloned()
        };
        match handler {
            Some(handler) => handler.handle(ctx, method, req.body.clone()).await,
            None => Err(Error::Transport(format!("no handler {name}"))),
        }
    }
}

/// One joined client/server endpoint.
#[derive(Clone)]
pub struct MemoryTransport {
    mesh: Arc<MeshInner>,
    inner: Arc<TransportInner>,
}

#[async_trait]
impl Server for MemoryTransport {
    fn options(&self) -> ServerOptions {
        self.inner.options.clone()
    }

    async fn subscribe(&self, topic: &str, subscriber: Arc<dyn Subscriber>) -> Result<()> {
        self.mesh
            .topics
            .lock()
            .unwrap()
            .entry(topic.to_string())
            .or_default()
            .push(subscriber);
        Ok(())
    }

    async fn handle(&self, name: &str, handler: Arc<dyn RpcHandler>) -> Result<()> {
        self.inner
            .handlers
            .lock()
            .unwrap()
            .insert(name.to_string(), handler);
        Ok(())
    }
}

#[async_trait]
impl Client for MemoryTransport {
    async fn call(&self, ctx: &Context, req: &Request) -> Result<Value> {
        let name = req
            .method
            .split_once('.')
            .map(|(name, _)| name.to_string())
            .ok_or_else(|| Error::Transport(format!("malformed method {}", req.method)))?;

        let target = {
            let nodes = self.mesh.nodes.lock().unwrap();
            nodes
                .values()
                .find(|t| t.handlers.lock().unwrap().contains_key(&name))
                .cloned()
        };

        match target {
            Some(target) => target.dispatch(ctx, req).await,
            None => Err(Error::NotAvailable),
        }
    }

    async fn call_remote(&self, ctx: &Context, node: &Node, req: &Request) -> Result<Value> {
        let target = {
            let nodes = self.mesh.nodes.lock().unwrap();
            nodes.get(&node.address).cloned()
        };
        match target {
            Some(target) => target.dispatch(ctx, req).await,
            None => Err(Error::Transport(format!("no route to {}", node.address))),
        }
    }

    async fn publish(&self, ctx: &Context, publication: &Publication) -> Result<()> {
        self.mesh
            .published
            .lock()
            .unwrap()
            .push(publication.clone());

        let subscribers = {
            let topics = self.mesh.topics.lock().unwrap();
            topics.get(&publication.topic).cloned().unwrap_or_default()
        };
        for subscriber in subscribers {
            subscriber.handle(ctx, publication.body.clone()).await?;
        }
        Ok(())
    }
}
