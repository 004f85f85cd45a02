//! HTTP server wrapper.
//!
//! Routes and middleware are registered on a shared handle; each call to
//! [`HttpServer::serve`] snapshots them into an axum router and serves it
//! with `axum::serve` until [`HttpServer::graceful_stop`].

use std::future::IntoFuture;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::Request;
use axum::middleware::{from_fn, from_fn_with_state, Next};
use axum::routing::MethodRouter;
use axum::Router;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tower_http::trace::TraceLayer;

use crate::context::{Context, Extender, Peer};
use crate::error::{Error, Result};
use crate::http::middleware::{attach_context, ContextSeed, HttpMiddleware};
use crate::net::listener::{BackoffListener, Listener};
use crate::server::runner::StreamRunner;

#[derive(Debug, Clone, Default)]
pub struct HttpOptions {
    /// How long [`HttpServer::graceful_stop`] waits for in-flight requests
    /// before it stops waiting. `None` waits indefinitely.
    pub drain_timeout: Option<Duration>,
    /// Wrap everything in `tower_http`'s `TraceLayer`.
    pub trace_requests: bool,
}

struct Registry {
    router: Router,
    middleware: Vec<HttpMiddleware>,
    extenders: Vec<Extender>,
}

struct Inner {
    name: String,
    options: HttpOptions,
    registry: RwLock<Registry>,
    shutdown: CancellationToken,
    force: CancellationToken,
    tracker: TaskTracker,
}

/// HTTP/1.1 and h2c server with ordered middleware and context extenders.
///
/// Cheap to clone; clones share registrations and lifecycle.
#[derive(Clone)]
pub struct HttpServer {
    inner: Arc<Inner>,
}

impl HttpServer {
    pub fn new(name: impl Into<String>, options: HttpOptions) -> Self {
        Self {
            inner: Arc::new(Inner {
                name: name.into(),
                options,
                registry: RwLock::new(Registry {
                    router: Router::new(),
                    middleware: Vec::new(),
                    extenders: Vec::new(),
                }),
                shutdown: CancellationToken::new(),
                force: CancellationToken::new(),
                tracker: TaskTracker::new(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    fn registry(&self) -> std::sync::RwLockWriteGuard<'_, Registry> {
        self.inner
            .registry
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    pub fn route(&self, path: &str, method_router: MethodRouter) {
        let mut registry = self.registry();
        registry.router = std::mem::take(&mut registry.router).route(path, method_router);
    }

    /// Merge a prebuilt router, e.g. an RPC gateway.
    pub fn merge(&self, router: Router) {
        let mut registry = self.registry();
        registry.router = std::mem::take(&mut registry.router).merge(router);
    }

    /// Append a middleware. The first registered sees each request first.
    pub fn register_middleware(&self, middleware: HttpMiddleware) {
        self.registry().middleware.push(middleware);
    }

    pub fn register_context_extender(&self, extender: Extender) {
        self.registry().extenders.push(extender);
    }

    fn app(&self) -> Router {
        let registry = self
            .inner
            .registry
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner());

        let mut app = registry.router.clone();
        for middleware in registry.middleware.iter().rev() {
            let middleware = middleware.clone();
            app = app.layer(from_fn(move |req: Request, next: Next| middleware(req, next)));
        }

        let seed = ContextSeed {
            base: Context::with_cancellation(self.inner.shutdown.child_token()),
            extenders: registry.extenders.clone().into(),
        };
        app = app.layer(from_fn_with_state(seed, attach_context));

        if self.inner.options.trace_requests {
            app = app.layer(TraceLayer::new_for_http());
        }
        app
    }

    /// Serve on `listener` until [`graceful_stop`](Self::graceful_stop).
    ///
    /// Transient accept errors are retried with backoff; any other accept
    /// error stops this listener and is returned.
    pub async fn serve<L: Listener>(&self, listener: L) -> Result<()> {
        let app = self.app();
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
            })
            .into_future();

        tracing::info!(server = %self.inner.name, address = %address, "HTTP server listening");

        let force = self.inner.force.clone();
        let name = self.inner.name.clone();
        self.inner
            .tracker
            .track_future(async move {
                tokio::select! {
                    result = serving => result,
                    _ = force.cancelled() => {
                        tracing::warn!(server = %name, "Drain deadline passed, abandoning open requests");
                        Ok(())
                    }
                }
            })
            .await?;

        if let Some(source) = fatal.take() {
            return Err(Error::Accept {
                name: self.inner.name.clone(),
                source,
            });
        }
        tracing::info!(server = %self.inner.name, address = %address, "HTTP server stopped");
        Ok(())
    }

    /// Stop accepting on every listener and wait for in-flight requests,
    /// bounded by the drain timeout.
    pub async fn graceful_stop(&self) {
        self.inner.shutdown.cancel();
        self.inner.tracker.close();

        if let Some(limit) = self.inner.options.drain_timeout {
            if tokio::time::timeout(limit, self.inner.tracker.wait()).await.is_ok() {
                return;
            }
            self.inner.force.cancel();
        }
        self.inner.tracker.wait().await;
    }
}

impl std::fmt::Debug for HttpServer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpServer")
            .field("name", &self.inner.name)
            .field("options", &self.inner.options)
            .finish_non_exhaustive()
    }
}

#[async_trait]
impl StreamRunner for HttpServer {
    async fn serve(&self, listener: TcpListener) -> Result<()> {
        HttpServer::serve(self, listener).await
    }

    async fn graceful_stop(&self) -> Result<()> {
        HttpServer::graceful_stop(self).await;
        Ok(())
    }
}
