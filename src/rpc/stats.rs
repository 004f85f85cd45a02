//! Per-call telemetry hooks.
//!
//! Hooks are explicit values registered on an [`RpcServer`](crate::rpc::RpcServer);
//! nothing is registered process-wide.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context as TaskContext, Poll};
use std::time::{Duration, Instant};

use axum::body::{Body, Bytes};
use axum::http::{HeaderMap, StatusCode};
use http_body::{Frame, SizeHint};
use tonic::Code;

use crate::context::Context;
use crate::rpc::interceptor::CallInfo;

/// A point in a call's life.
#[derive(Debug)]
pub enum StatsEvent<'a> {
    /// After context extension, before the first interceptor.
    Begin { call: &'a CallInfo },
    /// After the response body ended or was dropped.
    End {
        call: &'a CallInfo,
        elapsed: Duration,
        http_status: StatusCode,
        /// From the trailers, or the headers for trailers-only responses.
        /// `Cancelled` when the body was dropped before it ended.
        code: Option<Code>,
    },
}

/// Receives call events, in registration order relative to other handlers.
pub trait StatsHandler: Send + Sync + 'static {
    fn handle(&self, ctx: &Context, event: &StatsEvent<'_>);
}

/// Logs every call through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingStats;

impl StatsHandler for TracingStats {
    fn handle(&self, ctx: &Context, event: &StatsEvent<'_>) {
        let peer = ctx.peer().map(|p| p.to_string()).unwrap_or_default();
        match event {
            StatsEvent::Begin { call } => {
                tracing::debug!(method = %call.method, kind = ?call.kind, peer = %peer, "RPC started");
            }
            StatsEvent::End {
                call,
                elapsed,
                http_status,
                code,
            } => {
                tracing::info!(
                    method = %call.method,
                    kind = ?call.kind,
                    peer = %peer,
                    elapsed_ms = elapsed.as_millis() as u64,
                    http_status = http_status.as_u16(),
                    grpc_code = ?code,
                    "RPC finished"
                );
            }
        }
    }
}

pub(crate) fn grpc_code(headers: &HeaderMap) -> Option<Code> {
    headers
        .get("grpc-status")
        .map(|value| Code::from_bytes(value.as_bytes()))
}

/// The pending `End` event of one call.
pub(crate) struct CallEnd {
    pub(crate) ctx: Context,
    pub(crate) call: CallInfo,
    pub(crate) stats: Arc<[Arc<dyn StatsHandler>]>,
    pub(crate) started: Instant,
    pub(crate) http_status: StatusCode,
    pub(crate) code: Option<Code>,
}

impl CallEnd {
    fn emit(self) {
        let end = StatsEvent::End {
            call: &self.call,
            elapsed: self.started.elapsed(),
            http_status: self.http_status,
            code: self.code,
        };
        for stats in self.stats.iter() {
            stats.handle(&self.ctx, &end);
        }
    }
}

/// Response body that emits [`StatsEvent::End`] once the call is over.
pub(crate) struct StatsBody {
    inner: Body,
    end: Option<CallEnd>,
}

impl StatsBody {
    pub(crate) fn new(inner: Body, end: CallEnd) -> Self {
        Self {
            inner,
            end: Some(end),
        }
    }

    fn finish(&mut self, code: Option<Code>) {
        if let Some(mut end) = self.end.take() {
            end.code = code.or(end.code);
            end.emit();
        }
    }
}

impl http_body::Body for StatsBody {
    type Data = Bytes;
    type Error = axum::Error;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
    ) -> Poll<Option<Result<Frame<Self::Data>, Self::Error>>> {
        let this = &mut *self;
        let polled = Pin::new(&mut this.inner).poll_frame(cx);
        match &polled {
            Poll::Ready(Some(Ok(frame))) => {
                let trailers = frame.trailers_ref().and_then(grpc_code);
                if let (Some(code), Some(end)) = (trailers, this.end.as_mut()) {
                    end.code = Some(code);
                }
                if this.inner.is_end_stream() {
                    this.finish(None);
                }
            }
            Poll::Ready(Some(Err(_))) => this.finish(Some(Code::Internal)),
            Poll::Ready(None) => this.finish(None),
            Poll::Pending => {}
        }
        polled
    }

    fn is_end_stream(&self) -> bool {
        http_body::Body::is_end_stream(&self.inner)
    }

    fn size_hint(&self) -> SizeHint {
        self.inner.size_hint()
    }
}

impl Drop for StatsBody {
    fn drop(&mut self) {
        // Trailers-only responses may never be polled.
        let ended = http_body::Body::is_end_stream(&self.inner);
        if let Some(mut end) = self.end.take() {
            if !ended && end.code.is_none() {
                end.code = Some(Code::Cancelled);
            }
            end.emit();
        }
    }
}
