//! # meshkit-core: collaborator contracts
//!
//! The meshkit subsystems do not talk to the network themselves; they
//! consume a small set of pluggable collaborators. This crate defines
//! those capability sets as object-safe async traits, plus the
//! key/value context scope that rides along every call:
//!
//! - [`Client`] — outbound RPC and topic publication
//! - [`Server`] — local identity, subscriptions and RPC handlers
//! - [`Registry`] — service registration and watch streams
//! - [`CoordinationStore`] — the lock/leader backend
//! - [`RouterApi`] — the global load-balancer RPC surface
//! - [`Context`] / [`Metadata`] — header propagation
//!
//! Concrete transports (an in-process mesh, consul, etcd, a real RPC
//! stack) implement these traits outside this workspace's core; the
//! subsystems only ever hold `Arc<dyn ...>`.

mod auth;
mod client;
mod context;
mod registry;
mod router_api;
mod server;
mod store;
pub mod codec;
pub mod topics;

pub use auth::{AUTHORIZATION_HEADER, Token};
pub use client::{Client, Publication, Request};
pub use context::{Context, Metadata};
pub use registry::{Registry, Watcher};
pub use router_api::{RouterApi, SelectReply, SelectStream};
pub use server::{RpcHandler, Server, ServerOptions, Subscriber};
pub use store::{CoordinationStore, LockRequest, StoreLock};
