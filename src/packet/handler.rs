//! Datagram handlers and handler-transforming middleware.

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use bytes::Bytes;
use tokio::net::UdpSocket;

use crate::context::Context;
use crate::error::BoxError;

/// Sends replies to the sender of one datagram, on the socket it arrived on.
///
/// Does not keep the socket open: once serving stops, `send` fails with
/// `NotConnected`.
#[derive(Debug, Clone)]
pub struct ReplyTo {
    socket: Weak<UdpSocket>,
    peer_addr: SocketAddr,
}

impl ReplyTo {
    pub(crate) fn new(socket: &Arc<UdpSocket>, peer_addr: SocketAddr) -> Self {
        Self {
            socket: Arc::downgrade(socket),
            peer_addr,
        }
    }

    pub async fn send(&self, payload: &[u8]) -> io::Result<usize> {
        let socket = self
            .socket
            .upgrade()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "packet socket closed"))?;
        socket.send_to(payload, self.peer_addr).await
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }
}

/// One received datagram. `payload` is a copy; it outlives the read buffer.
#[derive(Debug, Clone)]
pub struct Datagram {
    pub payload: Bytes,
    pub peer_addr: SocketAddr,
    pub reply: ReplyTo,
}

/// Handles one datagram. Runs inline in the read loop, so a slow handler
/// delays the next read on the same socket.
#[async_trait]
pub trait PacketHandler: Send + Sync + 'static {
    async fn serve_packet(&self, ctx: Context, packet: Datagram) -> Result<(), BoxError>;
}

/// Wraps a handler into another handler.
pub type PacketMiddleware =
    Arc<dyn Fn(Arc<dyn PacketHandler>) -> Arc<dyn PacketHandler> + Send + Sync>;

/// Compose `middleware` around `handler`; the first entry ends up outermost.
pub fn compose(
    middleware: &[PacketMiddleware],
    handler: Arc<dyn PacketHandler>,
) -> Arc<dyn PacketHandler> {
    middleware
        .iter()
        .rev()
        .fold(handler, |inner, wrap| wrap(inner))
}

struct HandlerFn<F>(F);

#[async_trait]
impl<F, Fut> PacketHandler for HandlerFn<F>
where
    F: Fn(Context, Datagram) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
{
    async fn serve_packet(&self, ctx: Context, packet: Datagram) -> Result<(), BoxError> {
        (self.0)(ctx, packet).await
    }
}

/// Build a handler from an async closure.
pub fn handler_fn<F, Fut>(f: F) -> Arc<dyn PacketHandler>
where
    F: Fn(Context, Datagram) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<(), BoxError>> + Send + 'static,
{
    Arc::new(HandlerFn(f))
}

/// Build a middleware from a closure over the inner handler.
pub fn middleware_fn<F, H>(f: F) -> PacketMiddleware
where
    F: Fn(Arc<dyn PacketHandler>) -> H + Send + Sync + 'static,
    H: PacketHandler,
{
    Arc::new(move |inner| Arc::new(f(inner)) as Arc<dyn PacketHandler>)
}
