//! Shared utilities for integration tests.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use switchboard::config::{ListenConfig, ServerConfig};
use switchboard::{Result, Server};

/// A loopback TCP address nobody is listening on.
pub async fn free_tcp_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap()
}

/// A loopback UDP address nobody is bound to.
pub async fn free_udp_addr() -> SocketAddr {
    let socket = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    socket.local_addr().unwrap()
}

/// Every built-in server disabled.
pub fn disabled() -> ServerConfig {
    ServerConfig {
        listen: ListenConfig {
            grpc: String::new(),
            http: String::new(),
            internal_grpc: String::new(),
            internal_http: String::new(),
        },
        ..ServerConfig::default()
    }
}

/// Only the external HTTP server, on `addr`.
pub fn http_only(addr: SocketAddr) -> ServerConfig {
    let mut config = disabled();
    config.listen.http = addr.to_string();
    config
}

/// Only the internal HTTP server, on `addr`.
pub fn internal_http_only(addr: SocketAddr) -> ServerConfig {
    let mut config = disabled();
    config.listen.internal_http = addr.to_string();
    config
}

pub fn spawn_run(server: &Arc<Server>, shutdown: &CancellationToken) -> JoinHandle<Result<()>> {
    let server = server.clone();
    let shutdown = shutdown.clone();
    tokio::spawn(async move { server.run(shutdown).await })
}

/// Wait until something accepts TCP connections on `addr`.
pub async fn wait_for_tcp(addr: SocketAddr) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while TcpStream::connect(addr).await.is_err() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("listener did not come up");
}

/// Wait for `run` to return, failing the test if it hangs.
pub async fn join_run(handle: JoinHandle<Result<()>>) -> Result<()> {
    tokio::time::timeout(Duration::from_secs(5), handle)
        .await
        .expect("run did not return")
        .expect("run panicked")
}
