//! HTTP middleware plumbing.

use std::future::Future;
use std::sync::Arc;

use axum::extract::{ConnectInfo, Request, State};
use axum::middleware::Next;
use axum::response::Response;
use futures_util::future::BoxFuture;

use crate::context::{self, Context, Extender, Peer};

/// A middleware function over axum requests.
pub type HttpMiddleware = Arc<dyn Fn(Request, Next) -> BoxFuture<'static, Response> + Send + Sync>;

/// Build an [`HttpMiddleware`] from an async function or closure.
pub fn middleware_fn<F, Fut>(f: F) -> HttpMiddleware
where
    F: Fn(Request, Next) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Response> + Send + 'static,
{
    Arc::new(move |req, next| Box::pin(f(req, next)))
}

#[derive(Clone)]
pub(crate) struct ContextSeed {
    pub(crate) base: Context,
    pub(crate) extenders: Arc<[Extender]>,
}

/// Outermost layer: seed the request's [`Context`] with the peer, run the
/// extenders and store it as a request extension.
pub(crate) async fn attach_context(
    State(seed): State<ContextSeed>,
    mut req: Request,
    next: Next,
) -> Response {
    let mut ctx = seed.base.child();
    if let Some(ConnectInfo(peer)) = req.extensions().get::<ConnectInfo<Peer>>() {
        ctx = ctx.with_value(*peer);
    }
    let ctx = context::extend(&seed.extenders, ctx);
    req.extensions_mut().insert(ctx);
    next.run(req).await
}
