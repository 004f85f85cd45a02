//! HTTP server wrapper.
//!
//! # Data Flow
//! ```text
//! accepted connection
//!     → TraceLayer (optional)
//!     → context layer (peer, extenders)
//!     → registered middleware, first registered outermost
//!     → route handler
//! ```

pub mod middleware;
pub mod request;
pub mod server;

pub use middleware::{middleware_fn, HttpMiddleware};
pub use request::{request_id, request_id_middleware, RequestId, RequestIdExt, X_REQUEST_ID};
pub use server::{HttpOptions, HttpServer};
