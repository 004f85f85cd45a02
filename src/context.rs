//! Per-request execution context and context extenders.
//!
//! Every inbound connection, datagram, RPC call and HTTP request is handled
//! with a [`Context`]. Wrappers seed it (cancellation plus the [`Peer`]) and
//! then run the registered [`Extender`]s in registration order, so values an
//! extender injects are visible to every interceptor, middleware and handler
//! downstream of it, and to none upstream.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::connect_info::Connected;
use axum::http::Extensions;
use axum::serve::IncomingStream;
use tokio_util::sync::CancellationToken;

use crate::net::listener::{BackoffListener, Listener};
use crate::net::loopback::{LoopbackAddr, LoopbackListener};

/// Function deriving a new context from an existing one.
pub type Extender = Arc<dyn Fn(Context) -> Context + Send + Sync>;

/// Wrap a closure as an [`Extender`].
pub fn extender<F>(f: F) -> Extender
where
    F: Fn(Context) -> Context + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Apply `extenders` to `ctx` in order.
pub fn extend(extenders: &[Extender], ctx: Context) -> Context {
    extenders.iter().fold(ctx, |ctx, ext| ext(ctx))
}

/// Cancellable execution context carrying typed values.
#[derive(Clone, Debug, Default)]
pub struct Context {
    cancellation: CancellationToken,
    values: Extensions,
}

impl Context {
    /// A context that is never cancelled unless a child of it is derived and cancelled.
    pub fn background() -> Self {
        Self::default()
    }

    /// A context cancelled together with `token`.
    pub fn with_cancellation(token: CancellationToken) -> Self {
        Self {
            cancellation: token,
            values: Extensions::new(),
        }
    }

    pub fn cancellation(&self) -> &CancellationToken {
        &self.cancellation
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancellation.is_cancelled()
    }

    /// Resolves once the context is cancelled.
    pub async fn cancelled(&self) {
        self.cancellation.cancelled().await
    }

    /// Derive a context whose cancellation is a child of this one.
    pub fn child(&self) -> Self {
        Self {
            cancellation: self.cancellation.child_token(),
            values: self.values.clone(),
        }
    }

    /// Attach a value, replacing any earlier value of the same type.
    pub fn with_value<T>(mut self, value: T) -> Self
    where
        T: Clone + Send + Sync + 'static,
    {
        self.values.insert(value);
        self
    }

    pub fn value<T>(&self) -> Option<&T>
    where
        T: Send + Sync + 'static,
    {
        self.values.get::<T>()
    }

    /// The remote side of the request, when the serving wrapper recorded one.
    pub fn peer(&self) -> Option<Peer> {
        self.value::<Peer>().copied()
    }
}

/// Remote side of an inbound request.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Peer {
    /// A real socket peer.
    Tcp(SocketAddr),
    /// A same-process caller on the loopback channel.
    Loopback,
}

impl Peer {
    pub fn is_loopback(&self) -> bool {
        matches!(self, Peer::Loopback)
    }
}

impl From<SocketAddr> for Peer {
    fn from(addr: SocketAddr) -> Self {
        Peer::Tcp(addr)
    }
}

impl From<LoopbackAddr> for Peer {
    fn from(_: LoopbackAddr) -> Self {
        Peer::Loopback
    }
}

impl fmt::Display for Peer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Peer::Tcp(addr) => write!(f, "{}", addr),
            Peer::Loopback => f.write_str("loopback"),
        }
    }
}

// Lets wrappers record the peer through `into_make_service_with_connect_info::<Peer>()`.
impl<L: Listener> Connected<IncomingStream<'_, BackoffListener<L>>> for Peer {
    fn connect_info(stream: IncomingStream<'_, BackoffListener<L>>) -> Self {
        Peer::Tcp(*stream.remote_addr())
    }
}

impl Connected<IncomingStream<'_, LoopbackListener>> for Peer {
    fn connect_info(_: IncomingStream<'_, LoopbackListener>) -> Self {
        Peer::Loopback
    }
}
