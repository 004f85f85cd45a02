//! Orchestrator: owns every endpoint and runs them as one unit.
//!
//! # Lifecycle
//! ```text
//! Server::new ─▶ register_* ─▶ run(token) ─▶ token cancelled or an endpoint fails
//!                                              ─▶ graceful_stop on every endpoint
//!                                              ─▶ run returns
//! ```
//!
//! Registration takes `&mut self` and so is finished before `run`, which
//! takes `&self`. `run` must not be entered twice at once.

pub mod group;
pub mod registry;
pub mod runner;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::http::StatusCode;
use axum::routing::get;
use axum::Json;
use tokio::net::{TcpListener, UdpSocket};
use tokio_util::sync::CancellationToken;

use crate::config::ServerConfig;
use crate::error::{Error, Result};
use crate::http::{HttpOptions, HttpServer};
use crate::rpc::{HealthResponder, RpcOptions, RpcServer, ServingState, TracingStats};
pub use group::TaskGroup;
pub use registry::{Endpoint, Registry, Runner, Transport};
pub use runner::{PacketRunner, StreamRunner};

pub const GRPC: &str = "grpc";
pub const HTTP: &str = "http";
pub const INTERNAL_GRPC: &str = "internal-grpc";
pub const INTERNAL_HTTP: &str = "internal-http";

/// External and internal RPC and HTTP servers plus any endpoints
/// collaborators register.
pub struct Server {
    grpc: RpcServer,
    http: HttpServer,
    internal_grpc: RpcServer,
    internal_http: HttpServer,
    registry: Registry,
    running: AtomicBool,
}

impl Server {
    /// Build the four built-in servers and register their addresses.
    ///
    /// An empty address disables that server.
    pub fn new(config: ServerConfig) -> Result<Self> {
        let dial_timeout = Duration::from_millis(config.loopback.dial_timeout_ms);
        let http_options = HttpOptions {
            drain_timeout: config.http.drain_timeout_secs.map(Duration::from_secs),
            trace_requests: config.http.trace_requests,
        };

        let grpc = RpcServer::new(
            GRPC,
            RpcOptions {
                loopback_dial_timeout: dial_timeout,
                reflection: false,
            },
        );
        let internal_grpc = RpcServer::new(
            INTERNAL_GRPC,
            RpcOptions {
                loopback_dial_timeout: dial_timeout,
                reflection: true,
            },
        );
        for rpc in [&grpc, &internal_grpc] {
            rpc.register_stats_handler(Arc::new(TracingStats));
        }

        let http = HttpServer::new(HTTP, http_options.clone());
        let internal_http = HttpServer::new(INTERNAL_HTTP, http_options);
        let health = grpc.health().clone();
        internal_http.route("/healthz", get(move || healthz(health.clone())));

        let mut server = Self {
            grpc,
            http,
            internal_grpc,
            internal_http,
            registry: Registry::default(),
            running: AtomicBool::new(false),
        };

        let listen = &config.listen;
        server.register_tcp_server(GRPC, &listen.grpc, Arc::new(server.grpc.clone()))?;
        server.register_tcp_server(HTTP, &listen.http, Arc::new(server.http.clone()))?;
        server.register_tcp_server(
            INTERNAL_GRPC,
            &listen.internal_grpc,
            Arc::new(server.internal_grpc.clone()),
        )?;
        server.register_tcp_server(
            INTERNAL_HTTP,
            &listen.internal_http,
            Arc::new(server.internal_http.clone()),
        )?;
        Ok(server)
    }

    pub fn grpc(&self) -> &RpcServer {
        &self.grpc
    }

    pub fn http(&self) -> &HttpServer {
        &self.http
    }

    pub fn internal_grpc(&self) -> &RpcServer {
        &self.internal_grpc
    }

    pub fn internal_http(&self) -> &HttpServer {
        &self.internal_http
    }

    /// Health of the external RPC surface.
    pub fn health(&self) -> &HealthResponder {
        self.grpc.health()
    }

    pub fn endpoints(&self) -> &[Endpoint] {
        self.registry.endpoints()
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Register a TCP server. Fails if another TCP endpoint already resolves
    /// to the same address.
    pub fn register_tcp_server(
        &mut self,
        name: impl Into<String>,
        address: &str,
        runner: Arc<dyn StreamRunner>,
    ) -> Result<()> {
        self.registry.register(name, address, Runner::Stream(runner))
    }

    /// Register a UDP server. Fails if another UDP endpoint already resolves
    /// to the same address.
    pub fn register_udp_server(
        &mut self,
        name: impl Into<String>,
        address: &str,
        runner: Arc<dyn PacketRunner>,
    ) -> Result<()> {
        self.registry.register(name, address, Runner::Packet(runner))
    }

    /// Serve every endpoint until `shutdown` is cancelled or one of them fails,
    /// then stop them all.
    ///
    /// Returns `Ok(())` when `shutdown` triggered the stop and the first
    /// endpoint error when a failure did.
    ///
    /// # Panics
    ///
    /// If called while already running.
    pub async fn run(&self, shutdown: CancellationToken) -> Result<()> {
        if self.running.swap(true, Ordering::SeqCst) {
            panic!("server is already running");
        }
        let _running = RunningFlag(&self.running);

        let group = TaskGroup::new(shutdown.child_token());

        for rpc in [&self.grpc, &self.internal_grpc] {
            let rpc = rpc.clone();
            group.spawn(format!("{}-loopback", rpc.name()), async move {
                rpc.serve_loopback().await
            });
        }

        for endpoint in self.registry.endpoints() {
            let name = endpoint.name().to_string();

            if let Some(addr) = endpoint.address() {
                let task = name.clone();
                match endpoint.runner().clone() {
                    Runner::Stream(runner) => group.spawn(task, async move {
                        let listener = TcpListener::bind(addr)
                            .await
                            .map_err(|source| Error::Bind { name, addr, source })?;
                        runner.serve(listener).await
                    }),
                    Runner::Packet(runner) => group.spawn(task, async move {
                        let socket = UdpSocket::bind(addr)
                            .await
                            .map_err(|source| Error::Bind { name, addr, source })?;
                        runner.serve(socket).await
                    }),
                }
            }

            let token = group.token().clone();
            let runner = endpoint.runner().clone();
            let name = endpoint.name().to_string();
            group.spawn(format!("{name}-stop"), async move {
                token.cancelled().await;
                match runner.graceful_stop().await {
                    Ok(()) => tracing::debug!(endpoint = %name, "Endpoint stopped"),
                    Err(err) => tracing::warn!(endpoint = %name, error = %err, "Graceful stop failed"),
                }
                Ok(())
            });
        }

        tracing::info!(endpoints = self.registry.endpoints().len(), "Server running");
        group.token().cancelled().await;
        if shutdown.is_cancelled() {
            tracing::info!("Shutdown requested, draining");
        }

        let result = group.wait().await;
        tracing::info!(clean = result.is_ok(), "Server stopped");
        result
    }
}

impl std::fmt::Debug for Server {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Server")
            .field("endpoints", &self.registry.endpoints())
            .field("running", &self.running.load(Ordering::SeqCst))
            .finish()
    }
}

struct RunningFlag<'a>(&'a AtomicBool);

impl Drop for RunningFlag<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}

async fn healthz(health: HealthResponder) -> (StatusCode, Json<serde_json::Value>) {
    let state = health.state();
    let status = match state {
        ServingState::Serving => StatusCode::OK,
        ServingState::Unknown | ServingState::NotServing => StatusCode::SERVICE_UNAVAILABLE,
    };
    (status, Json(serde_json::json!({ "status": state.as_str() })))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::schema::ListenConfig;

    fn config(listen: ListenConfig) -> ServerConfig {
        ServerConfig {
            listen,
            ..ServerConfig::default()
        }
    }

    #[test]
    fn builtin_endpoints_are_registered_in_order() {
        let server = Server::new(ServerConfig::default()).unwrap();
        let names: Vec<_> = server.endpoints().iter().map(|e| e.name()).collect();
        assert_eq!(names, vec![GRPC, HTTP, INTERNAL_GRPC, INTERNAL_HTTP]);
        assert_eq!(
            server.endpoints()[0].address(),
            Some("0.0.0.0:9090".parse().unwrap())
        );
    }

    #[test]
    fn builtin_addresses_must_differ() {
        let err = Server::new(config(ListenConfig {
            grpc: "127.0.0.1:7100".into(),
            http: "127.0.0.1:7100".into(),
            internal_grpc: String::new(),
            internal_http: String::new(),
        }))
        .unwrap_err();
        assert!(matches!(err, Error::AddressInUse { existing, .. } if existing == GRPC));
    }

    #[tokio::test]
    async fn healthz_follows_external_rpc_health() {
        let server = Server::new(config(ListenConfig {
            grpc: String::new(),
            http: String::new(),
            internal_grpc: String::new(),
            internal_http: String::new(),
        }))
        .unwrap();

        let (status, Json(body)) = healthz(server.health().clone()).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "serving");

        server.health().set_not_serving().await;
        let (status, Json(body)) = healthz(server.health().clone()).await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert_eq!(body["status"], "not_serving");
    }
}
