//! Switchboard: runs a process's network endpoints as one unit.
//!
//! A [`Server`] owns an external and an internal RPC server, an external and
//! an internal HTTP server, and any TCP/UDP endpoints collaborators register.
//! [`Server::run`] starts them all, stops them all when the caller cancels or
//! one of them fails, and reports the first failure.

// Core subsystems
pub mod context;
pub mod error;
pub mod net;
pub mod packet;
pub mod stream;

// Protocol wrappers
pub mod http;
pub mod rpc;

// Orchestration
pub mod server;

// Cross-cutting concerns
pub mod config;
pub mod lifecycle;
pub mod observability;
pub mod resilience;

pub use config::ServerConfig;
pub use context::{Context, Extender, Peer};
pub use error::{BoxError, Error, Result};
pub use http::HttpServer;
pub use rpc::RpcServer;
pub use server::{PacketRunner, Server, StreamRunner};
