//! Lifecycle management subsystem.
//!
//! # Data Flow
//! ```text
//! SIGTERM/SIGINT (signals.rs)
//!     → cancel run token
//!     → Server::run stops every endpoint
//!     → exit code from run's result
//! ```

pub mod signals;

pub use signals::{cancel_on_signal, shutdown_signal};
