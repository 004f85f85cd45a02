//! Datagram-oriented server: one read loop per socket, handlers run inline.

use std::net::SocketAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::net::UdpSocket;
use tokio_util::sync::CancellationToken;

use crate::context::Context;
use crate::error::{Error, Result};
use crate::packet::handler::{compose, Datagram, PacketHandler, PacketMiddleware, ReplyTo};
use crate::server::runner::PacketRunner;

/// Largest payload a UDP datagram can carry.
const MAX_DATAGRAM: usize = 65_535;

type SocketExtension = Arc<dyn Fn(Context, SocketAddr) -> Context + Send + Sync>;

/// Builder for [`PacketServer`].
pub struct PacketServerBuilder {
    name: String,
    handler: Arc<dyn PacketHandler>,
    middleware: Vec<PacketMiddleware>,
    base: Context,
    socket_ext: Option<SocketExtension>,
    remote_ext: Option<SocketExtension>,
}

impl PacketServerBuilder {
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = name.into();
        self
    }

    /// Append a middleware. The first one added sees each datagram first.
    pub fn middleware(mut self, middleware: PacketMiddleware) -> Self {
        self.middleware.push(middleware);
        self
    }

    pub fn base_context(mut self, ctx: Context) -> Self {
        self.base = ctx;
        self
    }

    /// Derive the context shared by every datagram of one socket.
    pub fn socket_context<F>(mut self, f: F) -> Self
    where
        F: Fn(Context, SocketAddr) -> Context + Send + Sync + 'static,
    {
        self.socket_ext = Some(Arc::new(f));
        self
    }

    /// Derive a datagram's context from its sender.
    pub fn remote_context<F>(mut self, f: F) -> Self
    where
        F: Fn(Context, SocketAddr) -> Context + Send + Sync + 'static,
    {
        self.remote_ext = Some(Arc::new(f));
        self
    }

    pub fn build(self) -> PacketServer {
        PacketServer {
            handler: compose(&self.middleware, self.handler),
            name: self.name,
            base: self.base,
            socket_ext: self.socket_ext,
            remote_ext: self.remote_ext,
            stop: CancellationToken::new(),
        }
    }
}

/// Reads datagrams and hands each to the composed handler, in order.
pub struct PacketServer {
    name: String,
    handler: Arc<dyn PacketHandler>,
    base: Context,
    socket_ext: Option<SocketExtension>,
    remote_ext: Option<SocketExtension>,
    stop: CancellationToken,
}

impl PacketServer {
    pub fn builder(handler: Arc<dyn PacketHandler>) -> PacketServerBuilder {
        PacketServerBuilder {
            name: "packet".to_string(),
            handler,
            middleware: Vec::new(),
            base: Context::background(),
            socket_ext: None,
            remote_ext: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Read datagrams from `socket` until stopped or a read fails.
    ///
    /// Empty datagrams are dispatched like any other. The socket is closed
    /// when this returns.
    pub async fn serve(&self, socket: UdpSocket) -> Result<()> {
        let socket = Arc::new(socket);
        let local_addr = socket.local_addr()?;
        let socket_ctx = match &self.socket_ext {
            Some(ext) => ext(self.base.clone(), local_addr),
            None => self.base.clone(),
        };

        tracing::info!(server = %self.name, address = %local_addr, "Packet server reading");

        let mut buf = vec![0u8; MAX_DATAGRAM];
        loop {
            let received = tokio::select! {
                biased;
                _ = self.stop.cancelled() => break,
                received = socket.recv_from(&mut buf) => received,
            };

            let (len, peer_addr) = received.map_err(|source| Error::Receive {
                name: self.name.clone(),
                source,
            })?;

            let packet = Datagram {
                payload: Bytes::copy_from_slice(&buf[..len]),
                peer_addr,
                reply: ReplyTo::new(&socket, peer_addr),
            };
            let ctx = match &self.remote_ext {
                Some(ext) => ext(socket_ctx.child(), peer_addr),
                None => socket_ctx.child(),
            };

            if let Err(err) = self.handler.serve_packet(ctx, packet).await {
                tracing::debug!(server = %self.name, peer_addr = %peer_addr, error = %err, "Packet handler failed");
            }
        }

        tracing::info!(server = %self.name, address = %local_addr, "Packet server stopped");
        Ok(())
    }

    /// Close every socket passed to [`serve`](Self::serve), now and later.
    pub fn graceful_stop(&self) {
        self.stop.cancel();
    }
}

#[async_trait]
impl PacketRunner for PacketServer {
    async fn serve(&self, socket: UdpSocket) -> Result<()> {
        PacketServer::serve(self, socket).await
    }

    async fn graceful_stop(&self) -> Result<()> {
        PacketServer::graceful_stop(self);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;
    use std::time::Duration;

    use super::*;
    use crate::error::BoxError;
    use crate::packet::handler::{handler_fn, middleware_fn};

    async fn bound() -> (UdpSocket, SocketAddr) {
        let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = socket.local_addr().unwrap();
        (socket, addr)
    }

    fn echo() -> Arc<dyn PacketHandler> {
        handler_fn(|_ctx, packet: Datagram| async move {
            let mut reply = b"echo:".to_vec();
            reply.extend_from_slice(&packet.payload);
            packet.reply.send(&reply).await?;
            Ok::<(), BoxError>(())
        })
    }

    #[tokio::test]
    async fn replies_go_to_the_sender() {
        let server = Arc::new(PacketServer::builder(echo()).build());
        let (socket, addr) = bound().await;
        let serving = tokio::spawn({
            let server = server.clone();
            async move { server.serve(socket).await }
        });

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(b"hello", addr).await.unwrap();
        let mut buf = [0u8; 64];
        let (len, from) = tokio::time::timeout(Duration::from_secs(2), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..len], b"echo:hello");
        assert_eq!(from, addr);

        server.graceful_stop();
        serving.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn empty_datagrams_are_dispatched() {
        let server = Arc::new(PacketServer::builder(echo()).build());
        let (socket, addr) = bound().await;
        let serving = tokio::spawn({
            let server = server.clone();
            async move { server.serve(socket).await }
        });

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(b"", addr).await.unwrap();
        let mut buf = [0u8; 64];
        let (len, _) = tokio::time::timeout(Duration::from_secs(2), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        assert_eq!(&buf[..len], b"echo:");

        server.graceful_stop();
        serving.await.unwrap().unwrap();
    }

    struct Marker {
        label: &'static str,
        log: Arc<Mutex<Vec<String>>>,
        inner: Arc<dyn PacketHandler>,
    }

    #[async_trait]
    impl PacketHandler for Marker {
        async fn serve_packet(&self, ctx: Context, packet: Datagram) -> Result<(), BoxError> {
            self.log.lock().unwrap().push(format!("{}:in", self.label));
            let result = self.inner.serve_packet(ctx, packet).await;
            self.log.lock().unwrap().push(format!("{}:out", self.label));
            result
        }
    }

    #[tokio::test]
    async fn middleware_order_and_context() {
        #[derive(Clone)]
        struct Sender(SocketAddr);

        let log: Arc<Mutex<Vec<String>>> = Arc::default();
        let handler = {
            let log = log.clone();
            handler_fn(move |ctx: Context, packet: Datagram| {
                let log = log.clone();
                async move {
                    let sender = ctx.value::<Sender>().map(|s| s.0);
                    assert_eq!(sender, Some(packet.peer_addr));
                    log.lock().unwrap().push("handler".to_string());
                    packet.reply.send(b"ok").await?;
                    Ok::<(), BoxError>(())
                }
            })
        };
        let wrap = |label: &'static str| {
            let log = log.clone();
            middleware_fn(move |inner| Marker {
                label,
                log: log.clone(),
                inner,
            })
        };

        let server = Arc::new(
            PacketServer::builder(handler)
                .middleware(wrap("outer"))
                .middleware(wrap("inner"))
                .remote_context(|ctx, peer| ctx.with_value(Sender(peer)))
                .build(),
        );
        let (socket, addr) = bound().await;
        let serving = tokio::spawn({
            let server = server.clone();
            async move { server.serve(socket).await }
        });

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(b"x", addr).await.unwrap();
        let mut buf = [0u8; 8];
        tokio::time::timeout(Duration::from_secs(2), client.recv_from(&mut buf))
            .await
            .unwrap()
            .unwrap();
        // The reply is sent from inside the handler; give the chain time to unwind.
        tokio::time::sleep(Duration::from_millis(20)).await;

        assert_eq!(
            *log.lock().unwrap(),
            vec!["outer:in", "inner:in", "handler", "inner:out", "outer:out"]
        );

        server.graceful_stop();
        serving.await.unwrap().unwrap();
    }

    #[tokio::test]
    async fn graceful_stop_closes_every_socket() {
        let server = Arc::new(PacketServer::builder(echo()).build());
        let (first, first_addr) = bound().await;
        let (second, second_addr) = bound().await;

        let mut serving = Vec::new();
        for socket in [first, second] {
            let server = server.clone();
            serving.push(tokio::spawn(async move { server.serve(socket).await }));
        }
        tokio::time::sleep(Duration::from_millis(20)).await;

        server.graceful_stop();
        for task in serving {
            tokio::time::timeout(Duration::from_secs(1), task)
                .await
                .expect("serve should return after graceful stop")
                .unwrap()
                .unwrap();
        }

        for addr in [first_addr, second_addr] {
            UdpSocket::bind(addr).await.expect("socket should be closed");
        }
    }

    #[tokio::test]
    async fn retained_reply_does_not_keep_the_socket_open() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let keep = handler_fn(move |_ctx: Context, packet: Datagram| {
            let tx = tx.clone();
            async move {
                let _ = tx.send(packet.reply);
                Ok::<(), BoxError>(())
            }
        });
        let server = Arc::new(PacketServer::builder(keep).build());
        let (socket, addr) = bound().await;
        let serving = tokio::spawn({
            let server = server.clone();
            async move { server.serve(socket).await }
        });

        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client.send_to(b"hi", addr).await.unwrap();
        let reply = tokio::time::timeout(Duration::from_secs(1), rx.recv())
            .await
            .unwrap()
            .unwrap();

        server.graceful_stop();
        serving.await.unwrap().unwrap();

        UdpSocket::bind(addr).await.expect("socket should be closed");
        let err = reply.send(b"late").await.unwrap_err();
        assert_eq!(err.kind(), std::io::ErrorKind::NotConnected);
    }
}
