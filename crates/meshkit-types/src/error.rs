//! The shared error set.
//!
//! Subsystems return errors from this closed set rather than defining
//! their own. Retry policy belongs to the caller; none of these carry
//! program-terminating semantics.

use std::fmt::Display;

/// Errors surfaced by meshkit subsystems.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The requested entity does not exist (KV key, registry entry).
    #[error("not found")]
    NotFound,

    /// The supplied auth token is missing, malformed or expired.
    #[error("invalid token")]
    InvalidToken,

    /// The entity is already registered.
    #[error("already exists")]
    AlreadyExists,

    /// The subsystem cannot serve the request in its current state
    /// (no candidate nodes, consumed handle, unresolved address).
    #[error("not available")]
    NotAvailable,

    /// The trace queue did not accept the span within the collect
    /// timeout. The span is dropped.
    #[error("collect timeout")]
    CollectTimeout,

    /// The lock was not acquired within the configured wait.
    #[error("lock unavailable")]
    LockUnavailable,

    /// A transport-level failure from an RPC collaborator.
    #[error("transport: {0}")]
    Transport(String),

    /// A watch stream failed.
    #[error("watch: {0}")]
    Watch(String),

    /// A wire body could not be encoded or decoded.
    #[error("codec: {0}")]
    Codec(String),
}

impl Error {
    /// Wraps an arbitrary transport failure.
    pub fn transport(err: impl Display) -> Self {
        Error::Transport(err.to_string())
    }

    /// Wraps an arbitrary codec failure.
    pub fn codec(err: impl Display) -> Self {
        Error::Codec(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, Error>;
