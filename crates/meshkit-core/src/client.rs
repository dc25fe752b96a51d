//! Outbound RPC and publication capability.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;

use meshkit_types::{Node, Result};

use crate::Context;

/// A request addressed by service name and `Service.Method` selector.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    pub service: String,
    pub method: String,
    pub body: Value,
}

impl Request {
    /// Builds a request, encoding `body` as a JSON value.
    pub fn new(
        service: impl Into<String>,
        method: impl Into<String>,
        body: &impl Serialize,
    ) -> Result<Self> {
        Ok(Self {
            service: service.into(),
            method: method.into(),
            body: crate::codec::encode(body)?,
        })
    }
}

/// A message addressed to a topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Publication {
    pub topic: String,
    pub body: Value,
}

impl Publication {
    pub fn new(topic: impl Into<String>, body: &impl Serialize) -> Result<Self> {
        Ok(Self {
            topic: topic.into(),
            body: crate::codec::encode(body)?,
        })
    }
}

/// The outbound half of the transport.
///
/// `call` routes by service name through whatever balancing the
/// transport does; `call_remote` pins the request to one node, which is
/// how the KV ring addresses specific replicas.
#[async_trait]
pub trait Client: Send + Sync {
    async fn call(&self, ctx: &Context, req: &Request) -> Result<Value>;

    async fn call_remote(&self, ctx: &Context, node: &Node, req: &Request) -> Result<Value>;

    async fn publish(&self, ctx: &Context, publication: &Publication) -> Result<()>;
}
