//! Crate-wide error type.
//!
//! # Taxonomy
//! - Configuration errors (`InvalidAddress`, `AddressInUse`, `Config`) surface
//!   synchronously from registration and are never retried.
//! - Fatal transport errors (`Bind`, `Accept`, `Receive`) end one endpoint's
//!   serve loop and trigger shutdown of every other endpoint.
//! - Transient accept errors never reach this type; the accept loop retries them.

use std::net::SocketAddr;

use crate::config::loader::ConfigError;

/// Boxed error used by handlers, whose failures never propagate to runners.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Result alias for fallible orchestrator operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Error type for server operations.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// An address string could not be resolved.
    #[error("invalid address {address:?}: {source}")]
    InvalidAddress {
        address: String,
        #[source]
        source: std::io::Error,
    },

    /// Another endpoint of the same transport already claimed the address.
    #[error("{transport} address {addr} already registered by {existing}")]
    AddressInUse {
        transport: &'static str,
        addr: SocketAddr,
        existing: String,
    },

    /// Failed to bind a listener or socket.
    #[error("{name}: failed to bind {addr}: {source}")]
    Bind {
        name: String,
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// Non-transient accept failure.
    #[error("{name}: failed to accept: {source}")]
    Accept {
        name: String,
        #[source]
        source: std::io::Error,
    },

    /// Datagram read failure.
    #[error("{name}: failed to receive: {source}")]
    Receive {
        name: String,
        #[source]
        source: std::io::Error,
    },

    /// The reflection service could not be built from the registered descriptors.
    #[error("failed to build reflection service: {0}")]
    Reflection(#[from] tonic_reflection::server::Error),

    /// A serve task panicked.
    #[error("task {task} panicked")]
    TaskPanicked { task: String },

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}
