//! Connection handlers and handler-transforming middleware.

use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};

use async_trait::async_trait;
use futures_util::future::BoxFuture;
use tokio::io::{AsyncRead, AsyncWrite, ReadBuf};

use crate::context::Context;
use crate::error::BoxError;
use crate::net::connection::ConnectionId;

/// Byte stream a [`Conn`] can wrap.
pub trait Io: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Io for T {}

/// An accepted connection.
///
/// The stream server shuts the connection down once the handler returns, so
/// handlers borrow it rather than own it.
pub struct Conn {
    io: Box<dyn Io>,
    id: ConnectionId,
    local_addr: SocketAddr,
    peer_addr: SocketAddr,
}

impl Conn {
    pub fn new(
        io: impl Io + 'static,
        id: ConnectionId,
        local_addr: SocketAddr,
        peer_addr: SocketAddr,
    ) -> Self {
        Self {
            io: Box::new(io),
            id,
            local_addr,
            peer_addr,
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }
}

impl std::fmt::Debug for Conn {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Conn")
            .field("id", &self.id)
            .field("local_addr", &self.local_addr)
            .field("peer_addr", &self.peer_addr)
            .finish_non_exhaustive()
    }
}

impl AsyncRead for Conn {
    fn poll_read(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_read(cx, buf)
    }
}

impl AsyncWrite for Conn {
    fn poll_write(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<io::Result<usize>> {
        Pin::new(&mut self.io).poll_write(cx, buf)
    }

    fn poll_flush(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_flush(cx)
    }

    fn poll_shutdown(mut self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<io::Result<()>> {
        Pin::new(&mut self.io).poll_shutdown(cx)
    }
}

/// Handles one accepted connection.
///
/// Errors are the handler's own concern: the server logs them at debug level
/// and otherwise ignores them.
#[async_trait]
pub trait StreamHandler: Send + Sync + 'static {
    async fn serve_conn(&self, ctx: Context, conn: &mut Conn) -> Result<(), BoxError>;
}

/// Wraps a handler into another handler.
pub type StreamMiddleware =
    Arc<dyn Fn(Arc<dyn StreamHandler>) -> Arc<dyn StreamHandler> + Send + Sync>;

/// Compose `middleware` around `handler`; the first entry ends up outermost.
pub fn compose(
    middleware: &[StreamMiddleware],
    handler: Arc<dyn StreamHandler>,
) -> Arc<dyn StreamHandler> {
    middleware
        .iter()
        .rev()
        .fold(handler, |inner, wrap| wrap(inner))
}

struct HandlerFn<F>(F);

#[async_trait]
impl<F> StreamHandler for HandlerFn<F>
where
    F: for<'a> Fn(Context, &'a mut Conn) -> BoxFuture<'a, Result<(), BoxError>>
        + Send
        + Sync
        + 'static,
{
    async fn serve_conn(&self, ctx: Context, conn: &mut Conn) -> Result<(), BoxError> {
        (self.0)(ctx, conn).await
    }
}

/// Build a handler from a closure returning a boxed future.
pub fn handler_fn<F>(f: F) -> Arc<dyn StreamHandler>
where
    F: for<'a> Fn(Context, &'a mut Conn) -> BoxFuture<'a, Result<(), BoxError>>
        + Send
        + Sync
        + 'static,
{
    Arc::new(HandlerFn(f))
}

/// Build a middleware from a closure over the inner handler.
pub fn middleware_fn<F, H>(f: F) -> StreamMiddleware
where
    F: Fn(Arc<dyn StreamHandler>) -> H + Send + Sync + 'static,
    H: StreamHandler,
{
    Arc::new(move |inner| Arc::new(f(inner)) as Arc<dyn StreamHandler>)
}
