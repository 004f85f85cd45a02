//! Packet runner: serves datagram sockets.
//!
//! # Data Flow
//! ```text
//! UdpSocket
//!     → recv_from (any error ends serve)
//!     → payload copied, reply bound to the sender
//!     → context: base → socket ext → remote ext
//!     → composed middleware → handler, awaited in the read loop
//! ```
//!
//! # Design Decisions
//! - No task per datagram: a socket's datagrams are handled in arrival order
//! - Handler errors are logged at debug level and dropped

pub mod handler;
pub mod server;

pub use handler::{compose, handler_fn, middleware_fn, Datagram, PacketHandler, PacketMiddleware, ReplyTo};
pub use server::{PacketServer, PacketServerBuilder};
