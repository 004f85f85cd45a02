//! Stream runner: serves connection-oriented listeners.
//!
//! # Data Flow
//! ```text
//! Listener
//!     → accept (transient errors: backoff 1ms → 1s, fatal errors: serve returns)
//!     → context: base → listener ext → connection ext → remote ext
//!     → spawned task: composed middleware → handler
//!     → connection shut down when the handler returns
//! ```
//!
//! # Design Decisions
//! - Handler errors stay inside the connection task
//! - Graceful stop closes listeners and returns; connection tasks finish on their own
//! - The middleware chain is composed once, at build time

pub mod handler;
pub mod server;

pub use handler::{compose, handler_fn, middleware_fn, Conn, StreamHandler, StreamMiddleware};
pub use server::{StreamServer, StreamServerBuilder};
