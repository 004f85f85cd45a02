//! Call interceptors.
//!
//! Every call passes through one top-level layer that builds the call's
//! [`Context`], emits stats events and then runs either the unary or the
//! stream interceptor chain, selected by the method path.

use std::collections::HashSet;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use axum::extract::{ConnectInfo, Request, State};
use axum::body::Body;
use axum::response::Response;
use futures_util::future::BoxFuture;
use crate::context::{self, Context, Extender, Peer};
use crate::rpc::stats::{grpc_code, CallEnd, StatsBody, StatsEvent, StatsHandler};

/// Methods whose calls go through the stream chain without being registered.
pub(crate) const BUILTIN_STREAMING_METHODS: &[&str] = &[
    "/grpc.health.v1.Health/Watch",
    "/grpc.reflection.v1.ServerReflection/ServerReflectionInfo",
    "/grpc.reflection.v1alpha.ServerReflection/ServerReflectionInfo",
];

/// Which interceptor chain a call runs through.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallKind {
    Unary,
    Stream,
}

/// Identity of the call being served; stored in its [`Context`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CallInfo {
    /// Full method path, `/package.Service/Method`.
    pub method: String,
    pub kind: CallKind,
}

/// One interceptor: inspect or replace the request, then call `next` or
/// answer directly.
pub type Interceptor = Arc<dyn Fn(Request, Next) -> BoxFuture<'static, Response> + Send + Sync>;

/// Build an [`Interceptor`] from an async closure.
pub fn interceptor_fn<F, Fut>(f: F) -> Interceptor
where
    F: Fn(Request, Next) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Response> + Send + 'static,
{
    Arc::new(move |req, next| Box::pin(f(req, next)))
}

/// The rest of the chain, ending at the service.
pub struct Next {
    chain: Arc<[Interceptor]>,
    index: usize,
    endpoint: axum::middleware::Next,
}

impl Next {
    pub async fn run(mut self, req: Request) -> Response {
        match self.chain.get(self.index).cloned() {
            Some(interceptor) => {
                self.index += 1;
                interceptor(req, self).await
            }
            None => self.endpoint.run(req).await,
        }
    }
}

/// The context of the call carried by `req`.
pub fn call_context(req: &Request) -> Option<&Context> {
    req.extensions().get::<Context>()
}

/// Answer a call with `status` instead of calling the service.
pub fn reject(status: tonic::Status) -> Response {
    status.into_http()
}

/// Everything the top-level layer needs, snapshotted when serving starts.
#[derive(Clone)]
pub(crate) struct CallChain {
    pub(crate) unary: Arc<[Interceptor]>,
    pub(crate) stream: Arc<[Interceptor]>,
    pub(crate) streaming_methods: Arc<HashSet<String>>,
    pub(crate) extenders: Arc<[Extender]>,
    pub(crate) stats: Arc<[Arc<dyn StatsHandler>]>,
    pub(crate) base: Context,
}

impl CallChain {
    fn kind_of(&self, method: &str) -> CallKind {
        if self.streaming_methods.contains(method) {
            CallKind::Stream
        } else {
            CallKind::Unary
        }
    }
}

pub(crate) async fn intercept(
    State(chain): State<CallChain>,
    mut req: Request,
    endpoint: axum::middleware::Next,
) -> Response {
    let method = req.uri().path().to_string();
    let call = CallInfo {
        kind: chain.kind_of(&method),
        method,
    };

    let mut ctx = chain.base.child().with_value(call.clone());
    if let Some(ConnectInfo(peer)) = req.extensions().get::<ConnectInfo<Peer>>() {
        ctx = ctx.with_value(*peer);
    }
    let ctx = context::extend(&chain.extenders, ctx);
    req.extensions_mut().insert(ctx.clone());

    for stats in chain.stats.iter() {
        stats.handle(&ctx, &StatsEvent::Begin { call: &call });
    }
    let started = Instant::now();

    let interceptors = match call.kind {
        CallKind::Unary => chain.unary.clone(),
        CallKind::Stream => chain.stream.clone(),
    };
    let response = Next {
        chain: interceptors,
        index: 0,
        endpoint,
    }
    .run(req)
    .await;

    if chain.stats.is_empty() {
        return response;
    }
    let (parts, body) = response.into_parts();
    let end = CallEnd {
        ctx,
        code: grpc_code(&parts.headers),
        http_status: parts.status,
        call,
        stats: chain.stats,
        started,
    };
    Response::from_parts(parts, Body::new(StatsBody::new(body, end)))
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use axum::body::Body;
    use axum::routing::post;
    use axum::Router;
    use tonic::Code;
    use tower::ServiceExt;

    use super::*;

    fn recording(label: &'static str, log: &Arc<Mutex<Vec<String>>>) -> Interceptor {
        let log = log.clone();
        interceptor_fn(move |req, next| {
            let log = log.clone();
            async move {
                log.lock().unwrap().push(format!("{label}:in"));
                let response = next.run(req).await;
                log.lock().unwrap().push(format!("{label}:out"));
                response
            }
        })
    }

    fn chain(unary: Vec<Interceptor>, stream: Vec<Interceptor>, streaming: &[&str]) -> CallChain {
        CallChain {
            unary: unary.into(),
            stream: stream.into(),
            streaming_methods: Arc::new(streaming.iter().map(|m| m.to_string()).collect()),
            extenders: Arc::new([]),
            stats: Arc::new([]),
            base: Context::background(),
        }
    }

    fn app(chain: CallChain, log: &Arc<Mutex<Vec<String>>>) -> Router {
        let log = log.clone();
        Router::new()
            .route(
                "/{*method}",
                post(move |req: Request| {
                    let log = log.clone();
                    async move {
                        let kind = call_context(&req)
                            .and_then(|ctx| ctx.value::<CallInfo>())
                            .map(|call| call.kind);
                        log.lock().unwrap().push(format!("service:{kind:?}"));
                        "done"
                    }
                }),
            )
            .layer(axum::middleware::from_fn_with_state(chain, intercept))
    }

    fn call(path: &str) -> Request {
        axum::http::Request::post(path)
            .body(Body::empty())
            .unwrap()
    }

    #[tokio::test]
    async fn unary_chain_runs_first_registered_outermost() {
        let log: Arc<Mutex<Vec<String>>> = Arc::default();
        let chain = chain(
            vec![recording("u1", &log), recording("u2", &log)],
            vec![recording("s1", &log)],
            &[],
        );

        app(chain, &log).oneshot(call("/pkg.Svc/Get")).await.unwrap();

        assert_eq!(
            *log.lock().unwrap(),
            vec!["u1:in", "u2:in", "service:Some(Unary)", "u2:out", "u1:out"]
        );
    }

    #[tokio::test]
    async fn registered_streaming_methods_use_the_stream_chain() {
        let log: Arc<Mutex<Vec<String>>> = Arc::default();
        let chain = chain(
            vec![recording("u1", &log)],
            vec![recording("s1", &log)],
            &["/pkg.Svc/Follow"],
        );

        app(chain, &log)
            .oneshot(call("/pkg.Svc/Follow"))
            .await
            .unwrap();

        assert_eq!(
            *log.lock().unwrap(),
            vec!["s1:in", "service:Some(Stream)", "s1:out"]
        );
    }

    #[tokio::test]
    async fn interceptor_can_answer_without_the_service() {
        let log: Arc<Mutex<Vec<String>>> = Arc::default();
        let deny = interceptor_fn(|_req, _next| async {
            reject(tonic::Status::permission_denied("nope"))
        });
        let chain = chain(vec![deny, recording("u2", &log)], vec![], &[]);

        let response = app(chain, &log)
            .oneshot(call("/pkg.Svc/Get"))
            .await
            .unwrap();

        assert!(log.lock().unwrap().is_empty());
        let code = response
            .headers()
            .get("grpc-status")
            .map(|v| Code::from_bytes(v.as_bytes()));
        assert_eq!(code, Some(Code::PermissionDenied));
    }

    #[tokio::test]
    async fn extenders_and_stats_see_the_call() {
        #[derive(Clone)]
        struct Tenant(&'static str);

        struct Recorder(Arc<Mutex<Vec<String>>>);
        impl StatsHandler for Recorder {
            fn handle(&self, ctx: &Context, event: &StatsEvent<'_>) {
                let tenant = ctx.value::<Tenant>().map(|t| t.0).unwrap_or("-");
                let label = match event {
                    StatsEvent::Begin { call } => format!("begin {} {tenant}", call.method),
                    StatsEvent::End { call, .. } => format!("end {} {tenant}", call.method),
                };
                self.0.lock().unwrap().push(label);
            }
        }

        let log: Arc<Mutex<Vec<String>>> = Arc::default();
        let mut chain = chain(vec![], vec![], &[]);
        chain.extenders = Arc::new([context::extender(|ctx| ctx.with_value(Tenant("acme")))]);
        chain.stats = Arc::new([Arc::new(Recorder(log.clone())) as Arc<dyn StatsHandler>]);

        app(chain, &log).oneshot(call("/pkg.Svc/Get")).await.unwrap();

        assert_eq!(
            *log.lock().unwrap(),
            vec![
                "begin /pkg.Svc/Get acme",
                "service:Some(Unary)",
                "end /pkg.Svc/Get acme"
            ]
        );
    }

    #[tokio::test]
    async fn call_ends_when_the_response_body_ends() {
        struct Recorder(Arc<Mutex<Vec<String>>>);
        impl StatsHandler for Recorder {
            fn handle(&self, _ctx: &Context, event: &StatsEvent<'_>) {
                if let StatsEvent::End { code, .. } = event {
                    self.0.lock().unwrap().push(format!("end {code:?}"));
                }
            }
        }

        let log: Arc<Mutex<Vec<String>>> = Arc::default();
        let mut chain = chain(vec![], vec![], &[]);
        chain.stats = Arc::new([Arc::new(Recorder(log.clone())) as Arc<dyn StatsHandler>]);

        let response = app(chain, &log).oneshot(call("/pkg.Svc/Get")).await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["service:Some(Unary)"]);

        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        assert_eq!(&body[..], b"done");
        assert_eq!(*log.lock().unwrap(), vec!["service:Some(Unary)", "end None"]);
    }

    #[tokio::test]
    async fn dropped_response_body_ends_the_call_as_cancelled() {
        struct Recorder(Arc<Mutex<Vec<Option<Code>>>>);
        impl StatsHandler for Recorder {
            fn handle(&self, _ctx: &Context, event: &StatsEvent<'_>) {
                if let StatsEvent::End { code, .. } = event {
                    self.0.lock().unwrap().push(*code);
                }
            }
        }

        let log: Arc<Mutex<Vec<String>>> = Arc::default();
        let codes: Arc<Mutex<Vec<Option<Code>>>> = Arc::default();
        let mut chain = chain(vec![], vec![], &[]);
        chain.stats = Arc::new([Arc::new(Recorder(codes.clone())) as Arc<dyn StatsHandler>]);

        let response = app(chain, &log).oneshot(call("/pkg.Svc/Get")).await.unwrap();
        assert!(codes.lock().unwrap().is_empty());
        drop(response);
        assert_eq!(*codes.lock().unwrap(), vec![Some(Code::Cancelled)]);
    }
}
