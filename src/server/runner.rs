//! Serving contracts the orchestrator drives.

use async_trait::async_trait;
use tokio::net::{TcpListener, UdpSocket};

use crate::error::Result;

/// A server that runs on a bound TCP listener.
///
/// `serve` returns `Ok(())` after a graceful stop and an error when the
/// listener fails. `graceful_stop` stops accepting on every listener passed
/// to `serve`; what it waits for is up to the implementation.
#[async_trait]
pub trait StreamRunner: Send + Sync + 'static {
    async fn serve(&self, listener: TcpListener) -> Result<()>;

    async fn graceful_stop(&self) -> Result<()>;
}

/// A server that runs on a bound UDP socket.
#[async_trait]
pub trait PacketRunner: Send + Sync + 'static {
    async fn serve(&self, socket: UdpSocket) -> Result<()>;

    async fn graceful_stop(&self) -> Result<()>;
}
