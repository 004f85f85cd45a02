//! In-process listener/dialer pair.
//!
//! The loopback channel lets a same-process client (the RPC gateway) reach the
//! RPC server without a socket. A dial creates an in-memory duplex pipe and
//! hands the server half to the listener; the dial completes only once the
//! serving side has accepted it.
//!
//! The listener is local-only: it has no address to bind and no way to be
//! turned into a network listener. The transport offers no confidentiality
//! or authentication.

use std::fmt;
use std::io;
use std::time::Duration;

use hyper_util::rt::TokioIo;
use tokio::io::DuplexStream;
use tokio::sync::{mpsc, oneshot};
use tonic::transport::{Channel, Endpoint, Uri};
use tower::util::MapErr;

use crate::error::BoxError;

/// Buffer size of each in-memory pipe.
const PIPE_CAPACITY: usize = 64 * 1024;

/// Default bound on how long a dial waits for the serving side.
pub const DEFAULT_DIAL_TIMEOUT: Duration = Duration::from_secs(5);

/// Placeholder authority used by loopback clients; it is never resolved.
const LOOPBACK_URI: &str = "http://loopback.invalid";

/// RPC client channel over the loopback dialer.
///
/// A dial that times out fails the call with `DEADLINE_EXCEEDED`.
pub type LoopbackChannel = MapErr<Channel, fn(tonic::transport::Error) -> BoxError>;

/// Address reported for loopback connections.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct LoopbackAddr;

impl fmt::Display for LoopbackAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("loopback")
    }
}

/// A pending dial waiting for the listener.
struct Handoff {
    io: DuplexStream,
    accepted: oneshot::Sender<()>,
}

/// Create a connected listener/dialer pair.
pub fn channel(dial_timeout: Duration) -> (LoopbackListener, LoopbackDialer) {
    let (tx, rx) = mpsc::channel(1);
    (
        LoopbackListener { rx },
        LoopbackDialer { tx, dial_timeout },
    )
}

/// Serving side of the loopback channel.
pub struct LoopbackListener {
    rx: mpsc::Receiver<Handoff>,
}

impl LoopbackListener {
    /// Wait for the next dial. Returns `None` once every dialer is gone.
    pub async fn accept(&mut self) -> Option<DuplexStream> {
        let handoff = self.rx.recv().await?;
        // The dialer may have timed out already; the pipe then reads EOF.
        let _ = handoff.accepted.send(());
        Some(handoff.io)
    }

    /// Stop accepting. Pending and future dials fail.
    pub fn close(&mut self) {
        self.rx.close();
    }
}

impl axum::serve::Listener for LoopbackListener {
    type Io = DuplexStream;
    type Addr = LoopbackAddr;

    async fn accept(&mut self) -> (Self::Io, Self::Addr) {
        match LoopbackListener::accept(self).await {
            Some(io) => (io, LoopbackAddr),
            // No dialer can ever reach us again; serve ends through its shutdown signal.
            None => std::future::pending().await,
        }
    }

    fn local_addr(&self) -> io::Result<Self::Addr> {
        Ok(LoopbackAddr)
    }
}

/// Client side of the loopback channel.
#[derive(Clone)]
pub struct LoopbackDialer {
    tx: mpsc::Sender<Handoff>,
    dial_timeout: Duration,
}

impl LoopbackDialer {
    /// Open a pipe to the listener.
    ///
    /// Blocks until the listener accepts. Fails with `TimedOut` if that takes
    /// longer than the dial timeout, and with `ConnectionRefused` if the
    /// listener is gone.
    pub async fn dial(&self) -> io::Result<DuplexStream> {
        let handshake = async {
            let (client, server) = tokio::io::duplex(PIPE_CAPACITY);
            let (accepted_tx, accepted_rx) = oneshot::channel();
            self.tx
                .send(Handoff {
                    io: server,
                    accepted: accepted_tx,
                })
                .await
                .map_err(|_| refused())?;
            accepted_rx.await.map_err(|_| refused())?;
            Ok::<_, io::Error>(client)
        };

        match tokio::time::timeout(self.dial_timeout, handshake).await {
            Ok(result) => result,
            Err(_) => Err(io::Error::new(
                io::ErrorKind::TimedOut,
                "loopback dial: deadline exceeded",
            )),
        }
    }

    /// A lazily connecting RPC client channel over this dialer.
    ///
    /// Must be called within a Tokio runtime.
    pub fn channel(&self) -> LoopbackChannel {
        let dialer = self.clone();
        let channel = Endpoint::from_static(LOOPBACK_URI).connect_with_connector_lazy(
            tower::service_fn(move |_: Uri| {
                let dialer = dialer.clone();
                async move { dialer.dial().await.map(TokioIo::new) }
            }),
        );
        MapErr::new(channel, deadline_exceeded as fn(_) -> _)
    }
}

/// Turn a timed-out dial anywhere in the error chain into a
/// `DEADLINE_EXCEEDED` status; tonic reports other connect failures as
/// `UNAVAILABLE`.
fn deadline_exceeded(err: tonic::transport::Error) -> BoxError {
    let mut source: Option<&(dyn std::error::Error + 'static)> = Some(&err);
    while let Some(current) = source {
        if let Some(io) = current.downcast_ref::<io::Error>() {
            if io.kind() == io::ErrorKind::TimedOut {
                return Box::new(tonic::Status::deadline_exceeded(io.to_string()));
            }
        }
        source = current.source();
    }
    Box::new(err)
}

fn refused() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionRefused, "loopback listener closed")
}

#[cfg(test)]
mod tests {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    use super::*;

    #[tokio::test]
    async fn dial_before_accept_completes_once_accepted() {
        let (mut listener, dialer) = channel(Duration::from_secs(2));

        let dial = tokio::spawn(async move { dialer.dial().await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!dial.is_finished(), "dial must wait for the accept");

        let mut server = listener.accept().await.unwrap();
        let mut client = dial.await.unwrap().unwrap();

        client.write_all(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");
    }

    #[tokio::test(start_paused = true)]
    async fn dial_times_out_without_listener() {
        let (_listener, dialer) = channel(Duration::from_millis(100));
        let err = dialer.dial().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::TimedOut);
        assert!(err.to_string().contains("deadline exceeded"));
    }

    #[tokio::test]
    async fn dial_is_refused_after_close() {
        let (mut listener, dialer) = channel(Duration::from_secs(1));
        listener.close();
        let err = dialer.dial().await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::ConnectionRefused);
    }
}
