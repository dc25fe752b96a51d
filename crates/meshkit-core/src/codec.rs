//! JSON body encoding shared by the collaborator traits.

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;

use meshkit_types::{Error, Result};

/// Encodes a message into a JSON body.
pub fn encode(body: &impl Serialize) -> Result<Value> {
    serde_json::to_value(body).map_err(Error::codec)
}

/// Decodes a JSON body into a typed message.
pub fn decode<T: DeserializeOwned>(body: Value) -> Result<T> {
    serde_json::from_value(body).map_err(Error::codec)
}
