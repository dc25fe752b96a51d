//! # meshkit-types: Core types for meshkit
//!
//! This crate contains the shared shapes used across the meshkit
//! subsystems:
//! - Service records ([`Service`], [`Node`]) as kept by the registry
//! - Liveness ([`Heartbeat`]) published by the discovery cache
//! - KV items ([`Item`]) and ring gossip ([`Announcement`])
//! - Registry mutation events ([`WatchEvent`], [`WatchAction`])
//! - Leader election state ([`LeaderStatus`])
//! - The shared error set ([`Error`])
//! - Identity helpers ([`identity`])

use std::collections::HashMap;
use std::fmt::{self, Display};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

mod error;
pub mod identity;

pub use error::{Error, Result};

/// A service as known to the registry.
///
/// Identity is `(name, version)`; a registry entry for a name holds one
/// `Service` per version. Nodes are the running instances of that
/// version.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Service {
    pub name: String,
    pub version: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
    #[serde(default)]
    pub nodes: Vec<Node>,
}

impl Service {
    /// Creates a service record with no metadata or nodes.
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            metadata: HashMap::new(),
            nodes: Vec::new(),
        }
    }

    /// Builder method appending a node.
    pub fn with_node(mut self, node: Node) -> Self {
        self.nodes.push(node);
        self
    }

    /// Builder method setting a metadata entry.
    pub fn with_metadata(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.metadata.insert(key.into(), value.into());
        self
    }
}

/// One running instance of a service.
///
/// `address` is `host:port`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Node {
    pub id: String,
    pub address: String,
    #[serde(default)]
    pub metadata: HashMap<String, String>,
}

impl Node {
    pub fn new(id: impl Into<String>, address: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            address: address.into(),
            metadata: HashMap::new(),
        }
    }
}

/// A periodic liveness publication for a registered service.
///
/// Consumers of the heartbeat topic infer liveness from `interval` and
/// `ttl`: a service missing for longer than `ttl` seconds is dead.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Heartbeat {
    pub service: Service,
    pub interval_secs: i64,
    pub ttl_secs: i64,
    /// Unix seconds, stamped at publish time.
    pub timestamp: i64,
}

/// A key/value entry as seen by callers of the KV subsystem.
///
/// A zero `expiration` means the item never expires.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Item {
    pub key: String,
    pub value: Bytes,
    pub expiration: Duration,
}

impl Item {
    pub fn new(key: impl Into<String>, value: impl Into<Bytes>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            expiration: Duration::ZERO,
        }
    }

    /// Builder method setting the expiration.
    pub fn with_expiration(mut self, expiration: Duration) -> Self {
        self.expiration = expiration;
        self
    }
}

/// A ring membership announcement gossiped between KV instances.
///
/// Only instances sharing `namespace` form a ring together.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Announcement {
    pub namespace: String,
    /// `host:port` the sender serves on.
    pub address: String,
    /// Unix seconds at send time; receivers keep it as last-seen.
    pub timestamp: i64,
}

/// The kind of a registry mutation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WatchAction {
    Create,
    Update,
    Delete,
}

impl Display for WatchAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WatchAction::Create => write!(f, "create"),
            WatchAction::Update => write!(f, "update"),
            WatchAction::Delete => write!(f, "delete"),
        }
    }
}

/// One registry mutation yielded by a watch stream.
///
/// For `Delete`, `service.nodes` lists the nodes being removed, not the
/// nodes that remain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WatchEvent {
    pub action: WatchAction,
    pub service: Service,
}

impl WatchEvent {
    pub fn new(action: WatchAction, service: Service) -> Self {
        Self { action, service }
    }
}

/// Where this process stands in a leader election.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LeaderStatus {
    #[default]
    Follower,
    Candidate,
    Elected,
}

/// Current wall-clock time as unix seconds.
pub fn unix_seconds() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_secs() as i64)
}

/// Current wall-clock time as unix microseconds.
pub fn unix_micros() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |d| d.as_micros() as i64)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn service_builder() {
        let svc = Service::new("greeter", "1.0.0")
            .with_metadata("region", "ap-southeast-2")
            .with_node(Node::new("greeter-1", "10.0.0.1:8080"));

        assert_eq!(svc.name, "greeter");
        assert_eq!(svc.version, "1.0.0");
        assert_eq!(svc.metadata.get("region").map(String::as_str), Some("ap-southeast-2"));
        assert_eq!(svc.nodes.len(), 1);
    }

    #[test]
    fn watch_event_round_trips_as_json() {
        let ev = WatchEvent::new(
            WatchAction::Delete,
            Service::new("greeter", "1.0.0").with_node(Node::new("greeter-1", "10.0.0.1:8080")),
        );

        let json = serde_json::to_string(&ev).unwrap();
        assert!(json.contains("\"delete\""));

        let back: WatchEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, ev);
    }

    #[test]
    fn item_defaults_to_non_expiring() {
        let item = Item::new("k", "v".as_bytes().to_vec());
        assert_eq!(item.expiration, Duration::ZERO);
    }

    #[test]
    fn unix_time_is_monotonic_enough() {
        let a = unix_micros();
        let b = unix_micros();
        assert!(b >= a);
    }
}
