//! Span and annotation shapes.

use std::collections::HashMap;

use bytes::Bytes;
use serde::{Deserialize, Serialize};

use meshkit_types::{Service, unix_micros};

/// The `parent_id` of a root span.
pub const ROOT_PARENT_ID: &str = "0";

/// One unit in a distributed trace.
///
/// A tree edge is `parent_id -> id`; every span in a trace shares
/// `trace_id`. Ids are opaque tokens minted by the configured
/// [`IdFormat`](crate::IdFormat).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Span {
    pub id: String,
    pub trace_id: String,
    /// `"0"` iff this span is the trace root.
    pub parent_id: String,
    #[serde(default)]
    pub name: String,
    /// Unix microseconds at span start.
    pub timestamp: i64,
    /// Microseconds; zero until the span finishes.
    #[serde(default)]
    pub duration: i64,
    #[serde(default)]
    pub debug: bool,
    #[serde(default)]
    pub source: Option<Service>,
    #[serde(default)]
    pub destination: Option<Service>,
    #[serde(default)]
    pub annotations: Vec<Annotation>,
}

impl Span {
    pub fn is_root(&self) -> bool {
        self.parent_id == ROOT_PARENT_ID
    }
}

/// What an annotation marks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum AnnotationType {
    ClientRequest,
    ClientResponse,
    ServerRequest,
    ServerResponse,
    Start,
    End,
    Custom,
}

/// A timestamped event or key/value attachment on a span.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Annotation {
    /// Unix microseconds.
    pub timestamp: i64,
    #[serde(rename = "type")]
    pub kind: Option<AnnotationType>,
    #[serde(default)]
    pub key: String,
    #[serde(default)]
    pub value: Bytes,
    #[serde(default)]
    pub debug: HashMap<String, String>,
    #[serde(default)]
    pub service: Option<Service>,
}

impl Annotation {
    /// A bare event annotation stamped with the current time.
    pub fn event(kind: AnnotationType, service: Option<Service>) -> Self {
        Self {
            timestamp: unix_micros(),
            kind: Some(kind),
            service,
            ..Self::default()
        }
    }
}
