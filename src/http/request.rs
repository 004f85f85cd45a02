//! Request IDs.
//!
//! An incoming `x-request-id` is kept; otherwise a UUID v4 is generated.
//! The ID is echoed on the response and stored in the request's
//! [`Context`] and extensions.

use axum::extract::Request;
use axum::http::{HeaderName, HeaderValue};
use axum::middleware::Next;
use axum::response::Response;
use uuid::Uuid;

use crate::context::Context;
use crate::http::middleware::{middleware_fn, HttpMiddleware};

pub const X_REQUEST_ID: HeaderName = HeaderName::from_static("x-request-id");

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestId(pub String);

impl std::fmt::Display for RequestId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

/// Access the request ID stored by [`request_id`].
pub trait RequestIdExt {
    fn request_id(&self) -> Option<&RequestId>;
}

impl RequestIdExt for Request {
    fn request_id(&self) -> Option<&RequestId> {
        self.extensions().get::<RequestId>()
    }
}

impl RequestIdExt for Context {
    fn request_id(&self) -> Option<&RequestId> {
        self.value::<RequestId>()
    }
}

pub async fn request_id(mut req: Request, next: Next) -> Response {
    let id = req
        .headers()
        .get(&X_REQUEST_ID)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_owned)
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let header = HeaderValue::from_str(&id).ok();

    if let Some(value) = &header {
        req.headers_mut().insert(X_REQUEST_ID, value.clone());
    }
    let request_id = RequestId(id);
    if let Some(ctx) = req.extensions_mut().remove::<Context>() {
        req.extensions_mut().insert(ctx.with_value(request_id.clone()));
    }
    req.extensions_mut().insert(request_id);

    let mut response = next.run(req).await;
    if let Some(value) = header {
        response.headers_mut().insert(X_REQUEST_ID, value);
    }
    response
}

/// [`request_id`] as a registrable middleware.
pub fn request_id_middleware() -> HttpMiddleware {
    middleware_fn(request_id)
}
