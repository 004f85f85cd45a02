//! Listener abstraction and the shared accept loop.
//!
//! # Responsibilities
//! - Abstract "accept a connection" over real sockets and test doubles
//! - Retry transient accept errors with capped exponential backoff
//! - Adapt a listener to `axum::serve`, surfacing fatal accept errors

use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::{TcpListener, TcpStream};
use tokio_util::sync::CancellationToken;

use crate::resilience::backoff::{is_transient, AcceptBackoff};

/// A source of inbound connections.
pub trait Listener: Send + 'static {
    type Io: AsyncRead + AsyncWrite + Unpin + Send + 'static;

    /// Accept one connection, returning it with the peer address.
    fn accept(&mut self) -> impl Future<Output = io::Result<(Self::Io, SocketAddr)>> + Send;

    fn local_addr(&self) -> io::Result<SocketAddr>;
}

impl Listener for TcpListener {
    type Io = TcpStream;

    fn accept(&mut self) -> impl Future<Output = io::Result<(Self::Io, SocketAddr)>> + Send {
        TcpListener::accept(self)
    }

    fn local_addr(&self) -> io::Result<SocketAddr> {
        TcpListener::local_addr(self)
    }
}

/// Accept the next connection, sleeping through transient failures.
///
/// Returns only on success or on an error [`is_transient`] rejects.
pub async fn accept_with_backoff<L: Listener>(
    listener: &mut L,
    backoff: &mut AcceptBackoff,
    name: &str,
) -> io::Result<(L::Io, SocketAddr)> {
    loop {
        match listener.accept().await {
            Ok(conn) => {
                backoff.reset();
                return Ok(conn);
            }
            Err(err) if is_transient(&err) => {
                let delay = backoff.next_delay();
                tracing::warn!(
                    server = name,
                    error = %err,
                    retry_in = ?delay,
                    "Transient accept error"
                );
                tokio::time::sleep(delay).await;
            }
            Err(err) => return Err(err),
        }
    }
}

/// Records the fatal accept error of a listener handed to `axum::serve`.
///
/// `axum::serve` cannot end on an accept error, so the adapter stores the
/// error, fires `token` (wired into the graceful shutdown signal) and parks.
#[derive(Debug, Clone, Default)]
pub struct FatalAccept {
    error: Arc<Mutex<Option<io::Error>>>,
    token: CancellationToken,
}

impl FatalAccept {
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Take the recorded error, if the listener failed.
    pub fn take(&self) -> Option<io::Error> {
        self.error
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take()
    }

    fn record(&self, err: io::Error) {
        self.error
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .get_or_insert(err);
        self.token.cancel();
    }
}

/// Adapts a [`Listener`] to `axum::serve` with the shared backoff policy.
pub struct BackoffListener<L> {
    inner: L,
    name: String,
    backoff: AcceptBackoff,
    fatal: FatalAccept,
}

impl<L: Listener> BackoffListener<L> {
    pub fn new(inner: L, name: impl Into<String>) -> (Self, FatalAccept) {
        let fatal = FatalAccept::default();
        let listener = Self {
            inner,
            name: name.into(),
            backoff: AcceptBackoff::new(),
            fatal: fatal.clone(),
        };
        (listener, fatal)
    }
}

impl<L: Listener> axum::serve::Listener for BackoffListener<L> {
    type Io = L::Io;
    type Addr = SocketAddr;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        match accept_with_backoff(&mut self.inner, &mut self.backoff, &self.name).await {
            Ok(conn) => conn,
            Err(err) => {
                tracing::error!(server = %self.name, error = %err, "Listener failed");
                self.fatal.record(err);
                std::future::pending().await
            }
        }
    }

    fn local_addr(&self) -> io::Result<Self::Addr> {
        self.inner.local_addr()
    }
}
