//! Connection-oriented server: accept loop plus one task per connection.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;

use crate::context::Context;
use crate::error::{Error, Result};
use crate::net::connection::{ConnectionId, ConnectionTracker};
use crate::net::listener::{accept_with_backoff, Listener};
use crate::resilience::backoff::AcceptBackoff;
use crate::server::runner::StreamRunner;
use crate::stream::handler::{compose, Conn, StreamHandler, StreamMiddleware};

/// Derives the context shared by every connection of one listener.
pub type ListenerExtension = Arc<dyn Fn(Context, SocketAddr) -> Context + Send + Sync>;

/// Derives a connection's context from its ID.
pub type ConnExtension = Arc<dyn Fn(Context, ConnectionId) -> Context + Send + Sync>;

/// Derives a connection's context from its peer address.
pub type RemoteExtension = Arc<dyn Fn(Context, SocketAddr) -> Context + Send + Sync>;

/// Builder for [`StreamServer`].
pub struct StreamServerBuilder {
    name: String,
    handler: Arc<dyn StreamHandler>,
    middleware: Vec<StreamMiddleware>,
    base: Context,
    listener_ext: Option<ListenerExtension>,
    conn_ext: Option<ConnExtension>,
    remote_ext: Option<RemoteExtension>,
}

impl StreamServerBuilder {
    /// Name used in logs and errors.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Append a middleware. The first one added sees each connection first.
    pub fn middleware(mut self, middleware: StreamMiddleware) -> Self {
        self.middleware.push(middleware);
        self
    }

    /// Context every connection context derives from.
    pub fn base_context(mut self, ctx: Context) -> Self {
        self.base = ctx;
        self
    }

    pub fn listener_context<F>(mut self, f: F) -> Self
    where
        F: Fn(Context, SocketAddr) -> Context + Send + Sync + 'static,
    {
        self.listener_ext = Some(Arc::new(f));
        self
    }

    pub fn conn_context<F>(mut self, f: F) -> Self
    where
        F: Fn(Context, ConnectionId) -> Context + Send + Sync + 'static,
    {
        self.conn_ext = Some(Arc::new(f));
        self
    }

    pub fn remote_context<F>(mut self, f: F) -> Self
    where
        F: Fn(Context, SocketAddr) -> Context + Send + Sync + 'static,
    {
        self.remote_ext = Some(Arc::new(f));
        self
    }

    /// Compose the middleware chain and build the server.
    pub fn build(self) -> StreamServer {
        StreamServer {
            handler: compose(&self.middleware, self.handler),
            name: self.name,
            base: self.base,
            listener_ext: self.listener_ext,
            conn_ext: self.conn_ext,
            remote_ext: self.remote_ext,
            stop: CancellationToken::new(),
            connections: ConnectionTracker::new(),
        }
    }
}

/// Accepts connections and runs the composed handler for each on its own task.
///
/// Transient accept errors are retried with capped exponential backoff;
/// any other accept error ends [`serve`](Self::serve). Handler errors never do.
pub struct StreamServer {
    name: String,
    handler: Arc<dyn StreamHandler>,
    base: Context,
    listener_ext: Option<ListenerExtension>,
    conn_ext: Option<ConnExtension>,
    remote_ext: Option<RemoteExtension>,
    stop: CancellationToken,
    connections: ConnectionTracker,
}

impl StreamServer {
    pub fn builder(handler: Arc<dyn StreamHandler>) -> StreamServerBuilder {
        StreamServerBuilder {
            name: "stream".to_string(),
            handler,
            middleware: Vec::new(),
            base: Context::background(),
            listener_ext: None,
            conn_ext: None,
            remote_ext: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Connections whose handler is still running.
    pub fn active_connections(&self) -> u64 {
        self.connections.active_count()
    }

    /// Accept connections on `listener` until stopped or the listener fails.
    ///
    /// The listener is dropped, and so closed, when this returns.
    pub async fn serve<L: Listener>(&self, mut listener: L) -> Result<()> {
        let local_addr = listener.local_addr()?;
        let listener_ctx = match &self.listener_ext {
            Some(ext) => ext(self.base.clone(), local_addr),
            None => self.base.clone(),
        };

        tracing::info!(server = %self.name, address = %local_addr, "Stream server accepting");

        let mut backoff = AcceptBackoff::new();
        loop {
            let accepted = tokio::select! {
                biased;
                _ = self.stop.cancelled() => break,
                accepted = accept_with_backoff(&mut listener, &mut backoff, &self.name) => accepted,
            };

            let (io, peer_addr) = accepted.map_err(|source| Error::Accept {
                name: self.name.clone(),
                source,
            })?;

            let guard = self.connections.track();
            let id = guard.id();
            let ctx = self.connection_context(&listener_ctx, id, peer_addr);
            let handler = Arc::clone(&self.handler);
            let mut conn = Conn::new(io, id, local_addr, peer_addr);

            tracing::debug!(server = %self.name, connection_id = %id, peer_addr = %peer_addr, "Connection accepted");

            tokio::spawn(async move {
                let _guard = guard;
                if let Err(err) = handler.serve_conn(ctx, &mut conn).await {
                    tracing::debug!(connection_id = %id, error = %err, "Connection handler failed");
                }
                let _ = conn.shutdown().await;
            });
        }

        drop(listener);
        tracing::info!(server = %self.name, address = %local_addr, "Stream server stopped");
        Ok(())
    }

    /// Close every listener passed to [`serve`](Self::serve), now and later.
    ///
    /// Returns immediately; running connection handlers are not waited for.
    pub fn graceful_stop(&self) {
        self.stop.cancel();
    }

    fn connection_context(&self, listener_ctx: &Context, id: ConnectionId, peer: SocketAddr) -> Context {
        let ctx = listener_ctx.child();
        let ctx = match &self.conn_ext {
            Some(ext) => ext(ctx, id),
            None => ctx,
        };
        match &self.remote_ext {
            Some(ext) => ext(ctx, peer),
            None => ctx,
        }
    }
}

#[async_trait]
impl StreamRunner for StreamServer {
    async fn serve(&self, listener: TcpListener) -> Result<()> {
        StreamServer::serve(self, listener).await
    }

    async fn graceful_stop(&self) -> Result<()> {
        StreamServer::graceful_stop(self);
        Ok(())
    }
}
