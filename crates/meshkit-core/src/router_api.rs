//! The global load-balancer RPC surface the router subsystem fronts.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use meshkit_types::{Result, Service};

/// One routing decision for a service name.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectReply {
    pub services: Vec<Service>,
    /// Unix seconds after which the decision is stale; `-1` means it
    /// stays valid until a stream update replaces it.
    pub expires: i64,
}

/// The remote router service.
#[async_trait]
pub trait RouterApi: Send + Sync {
    async fn select(&self, service: &str) -> Result<SelectReply>;

    /// Opens a stream of live routing updates for one service name.
    async fn select_stream(&self, service: &str) -> Result<Box<dyn SelectStream>>;
}

/// A server-streamed sequence of routing snapshots.
#[async_trait]
pub trait SelectStream: Send + Sync {
    async fn next(&mut self) -> Result<SelectReply>;
}
