//! Metrics through the `metrics` facade.
//!
//! No recorder or exporter is installed here; without one every call is a
//! no-op.
//!
//! # Metrics
//! - `rpc_started_total` (counter): calls by method, kind
//! - `rpc_handled_total` (counter): calls by method, kind, grpc code
//! - `rpc_duration_seconds` (histogram): call duration, until the response body ends
//! - `http_requests_total` (counter): requests by method, status
//! - `http_request_duration_seconds` (histogram): latency by method

use std::time::Instant;

use axum::extract::Request;
use axum::middleware::Next;
use axum::response::Response;
use metrics::{counter, histogram};

use crate::context::Context;
use crate::rpc::interceptor::{CallInfo, CallKind};
use crate::rpc::stats::{StatsEvent, StatsHandler};

fn kind_label(kind: CallKind) -> &'static str {
    match kind {
        CallKind::Unary => "unary",
        CallKind::Stream => "stream",
    }
}

pub fn record_rpc_started(call: &CallInfo) {
    counter!(
        "rpc_started_total",
        "method" => call.method.clone(),
        "kind" => kind_label(call.kind)
    )
    .increment(1);
}

pub fn record_rpc_handled(call: &CallInfo, code: &str, seconds: f64) {
    counter!(
        "rpc_handled_total",
        "method" => call.method.clone(),
        "kind" => kind_label(call.kind),
        "code" => code.to_string()
    )
    .increment(1);
    histogram!("rpc_duration_seconds", "method" => call.method.clone()).record(seconds);
}

pub fn record_http_request(method: &str, status: u16, start: Instant) {
    counter!(
        "http_requests_total",
        "method" => method.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
    histogram!("http_request_duration_seconds", "method" => method.to_string())
        .record(start.elapsed().as_secs_f64());
}

/// [`StatsHandler`] feeding the RPC metrics.
#[derive(Debug, Default, Clone, Copy)]
pub struct MetricsStats;

impl StatsHandler for MetricsStats {
    fn handle(&self, _ctx: &Context, event: &StatsEvent<'_>) {
        match event {
            StatsEvent::Begin { call } => record_rpc_started(call),
            StatsEvent::End {
                call,
                elapsed,
                code,
                ..
            } => {
                let code = code
                    .map(|c| format!("{c:?}"))
                    .unwrap_or_else(|| "Unknown".to_string());
                record_rpc_handled(call, &code, elapsed.as_secs_f64());
            }
        }
    }
}

/// HTTP middleware recording request count and latency.
pub async fn track_requests(req: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = req.method().to_string();
    let response = next.run(req).await;
    record_http_request(&method, response.status().as_u16(), start);
    response
}
