//! The local server surface a subsystem hangs handlers off.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::Value;

use meshkit_types::Result;

use crate::Context;

/// Identity and addressing of the hosting server.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ServerOptions {
    pub name: String,
    pub version: String,
    pub id: String,
    /// Bound address, `host:port`. May be unspecified (`0.0.0.0:...`)
    /// until the listener is up.
    pub address: String,
    /// Address to hand to peers; empty means derive from `address`.
    pub advertise: String,
    pub metadata: HashMap<String, String>,
}

/// Receives messages published to a subscribed topic.
#[async_trait]
pub trait Subscriber: Send + Sync {
    async fn handle(&self, ctx: &Context, body: Value) -> Result<()>;
}

/// Serves inbound RPCs for one handler name.
///
/// `method` is the selector after the handler name, e.g. `"Get"` for
/// a `KV.Get` request.
#[async_trait]
pub trait RpcHandler: Send + Sync {
    async fn handle(&self, ctx: &Context, method: &str, body: Value) -> Result<Value>;
}

/// The inbound half of the transport.
#[async_trait]
pub trait Server: Send + Sync {
    fn options(&self) -> ServerOptions;

    async fn subscribe(&self, topic: &str, subscriber: Arc<dyn Subscriber>) -> Result<()>;

    async fn handle(&self, name: &str, handler: Arc<dyn RpcHandler>) -> Result<()>;
}
