//! Collocated server-side storage and its RPC handler.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use meshkit_core::{Context, RpcHandler, codec};
use meshkit_types::{Error, Result, unix_seconds};

/// An item as carried on the wire. Expiration is whole seconds;
/// zero means non-expiring.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct WireItem {
    pub key: String,
    pub value: Vec<u8>,
    #[serde(default)]
    pub expiration: i64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct GetRequest {
    pub key: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct GetResponse {
    pub item: Option<WireItem>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PutRequest {
    pub item: WireItem,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct PutResponse {}

#[derive(Debug, Serialize, Deserialize)]
pub struct DelRequest {
    pub key: String,
}

#[derive(Debug, Default, Serialize, Deserialize)]
pub struct DelResponse {}

#[derive(Debug, Clone)]
struct Stored {
    value: Vec<u8>,
    expiration: i64,
    /// Unix seconds, stamped at put time.
    timestamp: i64,
}

/// The in-memory slice of the ring this process owns.
#[derive(Default)]
pub(crate) struct Store {
    items: Mutex<HashMap<String, Stored>>,
}

impl Store {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn get(&self, key: &str) -> Option<WireItem> {
        let items = self.items.lock().unwrap();
        let stored = items.get(key)?;
        if expired(stored, unix_seconds()) {
            return None;
        }
        Some(WireItem {
            key: key.to_string(),
            value: stored.value.clone(),
            expiration: stored.expiration,
        })
    }

    pub(crate) fn put(&self, item: WireItem) {
        let mut items = self.items.lock().unwrap();
        items.insert(
            item.key,
            Stored {
                value: item.value,
                expiration: item.expiration,
                timestamp: unix_seconds(),
            },
        );
    }

    #[cfg(test)]
    pub(crate) fn put_stamped(&self, item: WireItem, timestamp: i64) {
        let mut items = self.items.lock().unwrap();
        items.insert(
            item.key,
            Stored {
                value: item.value,
                expiration: item.expiration,
                timestamp,
            },
        );
    }

    pub(crate) fn del(&self, key: &str) {
        self.items.lock().unwrap().remove(key);
    }

    /// Drops every item whose expiration has passed as of `now`.
    pub(crate) fn purge_expired(&self, now: i64) {
        let mut items = self.items.lock().unwrap();
        items.retain(|_, stored| !expired(stored, now));
    }

    pub(crate) fn len(&self) -> usize {
        self.items.lock().unwrap().len()
    }
}

fn expired(stored: &Stored, now: i64) -> bool {
    stored.expiration > 0 && now - stored.timestamp > stored.expiration
}

/// Serves `KV.Get` / `KV.Put` / `KV.Del` over the local store.
pub(crate) struct StoreHandler {
    pub(crate) store: Arc<Store>,
}

#[async_trait]
impl RpcHandler for StoreHandler {
    async fn handle(&self, _ctx: &Context, method: &str, body: Value) -> Result<Value> {
        match method {
            "Get" => {
                let req: GetRequest = codec::decode(body)?;
                codec::encode(&GetResponse { item: self.store.get(&req.key) })
            }
            "Put" => {
                let req: PutRequest = codec::decode(body)?;
                self.store.put(req.item);
                codec::encode(&PutResponse {})
            }
            "Del" => {
                let req: DelRequest = codec::decode(body)?;
                self.store.del(&req.key);
                codec::encode(&DelResponse {})
            }
            other => Err(Error::Transport(format!("unknown KV method {other}"))),
        }
    }
}
