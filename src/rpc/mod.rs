//! RPC (gRPC) server wrapper.
//!
//! - [`RpcServer`]: service registry, TCP and loopback serving, graceful stop
//! - [`interceptor`]: unary and stream interceptor chains
//! - [`health`]: the `grpc.health.v1` responder
//! - [`stats`]: per-call telemetry hooks

pub mod health;
pub mod interceptor;
pub mod server;
pub mod stats;

pub use health::{HealthResponder, ServingState};
pub use interceptor::{interceptor_fn, CallInfo, CallKind, Interceptor, Next};
pub use server::{Gateway, RpcOptions, RpcServer};
pub use crate::net::loopback::LoopbackChannel;
pub use stats::{StatsEvent, StatsHandler, TracingStats};
