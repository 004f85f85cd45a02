//! RPC server wrapper.
//!
//! Services are registered onto a tonic route table; serving turns that
//! table into an axum router (gRPC, gRPC-Web and any gateway routes) and
//! runs it with `axum::serve` on a TCP listener or on the in-process
//! loopback channel.

use std::collections::HashSet;
use std::convert::Infallible;
use std::future::IntoFuture;
use std::sync::{Arc, Mutex, OnceLock, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use axum::error_handling::HandleError;
use axum::response::Response;
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tonic::server::NamedService;
use tonic::service::Routes;
use tonic_web::GrpcWebLayer;
use tower::{Layer, Service};

use crate::context::{Context, Extender, Peer};
use crate::error::{Error, Result};
use crate::net::listener::{BackoffListener, Listener};
use crate::net::loopback::{
    self, LoopbackChannel, LoopbackDialer, LoopbackListener, DEFAULT_DIAL_TIMEOUT,
};
use crate::rpc::health::HealthResponder;
use crate::rpc::interceptor::{intercept, CallChain, Interceptor, BUILTIN_STREAMING_METHODS};
use crate::rpc::stats::StatsHandler;
use crate::server::runner::StreamRunner;

/// Builds extra HTTP routes (typically a JSON gateway) that call back into
/// the server through the given loopback channel.
///
/// The router must not set a fallback; unmatched paths go to the gRPC table.
pub type Gateway = Arc<dyn Fn(LoopbackChannel) -> Router + Send + Sync>;

#[derive(Debug, Clone)]
pub struct RpcOptions {
    pub loopback_dial_timeout: Duration,
    /// Serve `grpc.reflection.v1` for the health service and every
    /// descriptor set registered with
    /// [`register_file_descriptor_set`](RpcServer::register_file_descriptor_set).
    pub reflection: bool,
}

impl Default for RpcOptions {
    fn default() -> Self {
        Self {
            loopback_dial_timeout: DEFAULT_DIAL_TIMEOUT,
            reflection: false,
        }
    }
}

struct Registry {
    routes: Routes,
    unary: Vec<Interceptor>,
    stream: Vec<Interceptor>,
    streaming_methods: HashSet<String>,
    extenders: Vec<Extender>,
    stats: Vec<Arc<dyn StatsHandler>>,
    gateways: Vec<Gateway>,
    descriptor_sets: Vec<&'static [u8]>,
    reflection: bool,
}

struct Inner {
    name: String,
    registry: RwLock<Registry>,
    health: HealthResponder,
    loopback: Mutex<Option<LoopbackListener>>,
    dialer: LoopbackDialer,
    loopback_conn: OnceLock<LoopbackChannel>,
    shutdown: CancellationToken,
    tracker: TaskTracker,
}

/// gRPC server with a health service, an in-process loopback channel and
/// unary/stream interceptor chains.
///
/// Cheap to clone; clones share registrations and lifecycle.
#[derive(Clone)]
pub struct RpcServer {
    inner: Arc<Inner>,
}

impl RpcServer {
    pub fn new(name: impl Into<String>, options: RpcOptions) -> Self {
        let (reporter, health_service) = tonic_health::server::health_reporter();
        let (listener, dialer) = loopback::channel(options.loopback_dial_timeout);

        let registry = Registry {
            routes: Routes::new(health_service),
            unary: Vec::new(),
            stream: Vec::new(),
            streaming_methods: BUILTIN_STREAMING_METHODS
                .iter()
                .map(|m| m.to_string())
                .collect(),
            extenders: Vec::new(),
            stats: Vec::new(),
            gateways: Vec::new(),
            descriptor_sets: Vec::new(),
            reflection: options.reflection,
        };

        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                registry: RwLock::new(registry),
                health: HealthResponder::new(reporter),
                loopback: Mutex::new(Some(listener)),
                dialer,
                loopback_conn: OnceLock::new(),
                shutdown: CancellationToken::new(),
                tracker: TaskTracker::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn health(&self) -> &HealthResponder {
        &self.inner.health
    }

    fn registry(&self) -> std::sync::RwLockWriteGuard<'_, Registry> {
        self.inner
            .registry
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Register a generated tonic service.
    pub fn add_service<S>(&self, service: S)
    where
        S: Service<axum::http::Request<tonic::body::Body>, Error = Infallible>
            + NamedService
            + Clone
            + Send
            + Sync
            + 'static,
        S::Response: axum::response::IntoResponse,
        S::Future: Send + 'static,
    {
        let mut registry = self.registry();
        registry.routes = std::mem::take(&mut registry.routes).add_service(service);
        tracing::debug!(server = %self.inner.name, service = S::NAME, "Registered RPC service");
    }

    /// Make an encoded `FileDescriptorSet` visible to reflection.
    pub fn register_file_descriptor_set(&self, encoded: &'static [u8]) {
        self.registry().descriptor_sets.push(encoded);
    }

    /// Append to the unary chain. The first registered runs outermost.
    pub fn register_unary_interceptor(&self, interceptor: Interceptor) {
        self.registry().unary.push(interceptor);
    }

    /// Append to the stream chain. The first registered runs outermost.
    pub fn register_stream_interceptor(&self, interceptor: Interceptor) {
        self.registry().stream.push(interceptor);
    }

    /// Route calls to `method` (`/package.Service/Method`) through the stream
    /// chain. Calls to unregistered methods are treated as unary.
    pub fn register_streaming_method(&self, method: impl Into<String>) {
        self.registry().streaming_methods.insert(method.into());
    }

    pub fn register_context_extender(&self, extender: Extender) {
        self.registry().extenders.push(extender);
    }

    pub fn register_stats_handler(&self, handler: Arc<dyn StatsHandler>) {
        self.registry().stats.push(handler);
    }

    pub fn register_gateway<F>(&self, gateway: F)
    where
        F: Fn(LoopbackChannel) -> Router + Send + Sync + 'static,
    {
        self.registry().gateways.push(Arc::new(gateway));
    }

    /// Client channel connected to this server's loopback listener.
    ///
    /// The channel connects lazily; calls made before
    /// [`serve_loopback`](Self::serve_loopback) starts wait for it up to the
    /// dial timeout, then fail with `DEADLINE_EXCEEDED`. Must first be
    /// called within a Tokio runtime.
    pub fn loopback_conn(&self) -> LoopbackChannel {
        self.inner
            .loopback_conn
            .get_or_init(|| self.inner.dialer.channel())
            .clone()
    }

    fn router(&self) -> Result<Router> {
        let registry = self
            .inner
            .registry
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let mut routes = registry.routes.clone();
        if registry.reflection {
            let mut reflection = tonic_reflection::server::Builder::configure()
                .register_encoded_file_descriptor_set(tonic_health::pb::FILE_DESCRIPTOR_SET);
            for set in registry.descriptor_sets.iter().copied() {
                reflection = reflection.register_encoded_file_descriptor_set(set);
            }
            routes = routes.add_service(reflection.build_v1()?);
        }

        let chain = CallChain {
            unary: registry.unary.clone().into(),
            stream: registry.stream.clone().into(),
            streaming_methods: Arc::new(registry.streaming_methods.clone()),
            extenders: registry.extenders.clone().into(),
            stats: registry.stats.clone().into(),
            base: Context::with_cancellation(self.inner.shutdown.child_token()),
        };

        let grpc = HandleError::new(GrpcWebLayer::new().layer(routes), routing_failed);
        let mut app = Router::new()
            .fallback_service(grpc)
            .layer(axum::middleware::from_fn_with_state(chain, intercept));
        for gateway in &registry.gateways {
            app = app.merge(gateway(self.loopback_conn()));
        }
        Ok(app)
    }

    /// Serve RPCs on `listener` until [`graceful_stop`](Self::graceful_stop).
    ///
    /// Transient accept errors are retried with backoff; any other accept
    /// error stops this listener and is returned.
    pub async fn serve<L: Listener>(&self, listener: L) -> Result<()> {
        let app = self.router()?;
        let address = listener.local_addr()?;
        let (listener, fatal) = BackoffListener::new(listener, self.inner.name.clone());

        let shutdown = self.inner.shutdown.clone();
        let failed = fatal.token().clone();
        let serving = axum::serve(listener, app.into_make_service_with_connect_info::<Peer>())
            .with_graceful_shutdown(async move {
                tokio::select! {
                    _ = shutdown.cancelled() => {}
                    _ = failed.cancelled() => {}
                }
            });

        tracing::info!(server = %self.inner.name, address = %address, "RPC server listening");
        self.inner.tracker.track_future(serving.into_future()).await?;

        if let Some(source) = fatal.take() {
            return Err(Error::Accept {
                name: self.inner.name.clone(),
                source,
            });
        }
        tracing::info!(server = %self.inner.name, address = %address, "RPC server stopped");
        Ok(())
    }

    /// Serve RPCs on the loopback channel. Only the first call serves; later
    /// calls return immediately.
    pub async fn serve_loopback(&self) -> Result<()> {
        let listener = self
            .inner
            .loopback
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .take();
        let Some(listener) = listener else {
            tracing::debug!(server = %self.inner.name, "Loopback already served");
            return Ok(());
        };

        let app = self.router()?;
        let shutdown = self.inner.shutdown.clone();
        let serving = axum::serve(listener, app.into_make_service_with_connect_info::<Peer>())
            .with_graceful_shutdown(async move { shutdown.cancelled().await });

        tracing::debug!(server = %self.inner.name, "RPC server serving loopback");
        self.inner.tracker.track_future(serving.into_future()).await?;
        Ok(())
    }

    /// Report not-serving, stop accepting everywhere and wait for in-flight
    /// calls to finish.
    pub async fn graceful_stop(&self) {
        self.inner.health.set_not_serving().await;
        self.inner.shutdown.cancel();
        if let Some(listener) = self
            .inner
            .loopback
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .as_mut()
        {
            listener.close();
        }
        self.inner.tracker.close();
        self.inner.tracker.wait().await;
        tracing::info!(server = %self.inner.name, "RPC server drained");
    }
}

async fn routing_failed<E: std::fmt::Display>(err: E) -> Response {
    tracing::error!(error = %err, "gRPC routing failed");
    tonic::Status::internal(err.to_string()).into_http()
}

impl std::fmt::Debug for RpcServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RpcServer")
            .field("name", &self.inner.name)
            .field("health", &self.inner.health)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl StreamRunner for RpcServer {
    async fn serve(&self, listener: TcpListener) -> Result<()> {
        RpcServer::serve(self, listener).await
    }

    async fn graceful_stop(&self) -> Result<()> {
        RpcServer::graceful_stop(self).await;
        Ok(())
    }
}
