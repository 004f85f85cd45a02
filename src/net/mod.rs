//! Network layer subsystem.
//!
//! # Data Flow
//! ```text
//! Address string (":9090", "localhost:19090")
//!     → addr.rs (resolve, prefer IPv4)
//!     → bound by the orchestrator
//!     → listener.rs (accept loop, transient error backoff)
//!     → connection.rs (connection IDs, live connection count)
//!     → handed to a stream server or an axum-served wrapper
//!
//! In-process calls:
//!     RPC gateway → loopback.rs dialer ⇄ loopback.rs listener → RPC server
//! ```
//!
//! # Design Decisions
//! - One accept loop shared by every TCP serving path
//! - The loopback pair is unreachable from any socket address

pub mod addr;
pub mod connection;
pub mod listener;
pub mod loopback;
