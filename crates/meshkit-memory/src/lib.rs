//! # meshkit-memory: in-process collaborators
//!
//! Real deployments hand the subsystems a network transport, a real
//! registry and a coordination store. This crate provides in-process
//! implementations of those contracts, good for tests, examples and
//! single-process wiring:
//!
//! - [`MemoryRegistry`] — a registry with working watch streams
//! - [`MemoryMesh`] / [`MemoryTransport`] — a client/server pair that
//!   routes calls and publications between joined transports
//! - [`MemoryStore`] — a coordination store with TTL expiry and
//!   session-lost signalling
//!
//! Everything is deterministic: publications are dispatched inline to
//! subscribers before `publish` returns, which keeps tests free of
//! sleeps.

mod registry;
mod store;
mod transport;

pub use registry::MemoryRegistry;
pub use store::MemoryStore;
pub use transport::{MemoryMesh, MemoryTransport};
