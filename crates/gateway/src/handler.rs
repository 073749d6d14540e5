//! The composable HTTP handler seam.
//!
//! Everything on the HTTP data plane, middlewares and services alike, is
//! an [`HttpHandler`]. Middlewares wrap the next handler; services sit at
//! the bottom of the chain. Handlers never fail: errors become responses.

use std::net::IpAddr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use http::StatusCode;
use http_body_util::{BodyExt, Empty, Full};

/// Boxed error type shared across body and client plumbing.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// The uniform body type on the proxy data plane.
pub type Body = http_body_util::combinators::BoxBody<Bytes, BoxError>;

/// A request as seen by handlers.
pub type Request = http::Request<Body>;

/// A response as produced by handlers.
pub type Response = http::Response<Body>;

/// A shareable handler; cloned freely into router tables.
pub type SharedHandler = Arc<dyn HttpHandler>;

/// Per-request dispatch context, carried in request extensions.
#[derive(Debug, Clone)]
pub struct RequestContext {
    /// Qualified name of the matched router.
    pub router: String,
    /// Qualified name of the resolved service.
    pub service: String,
    /// Entry point the request arrived on.
    pub entry_point: String,
    /// Peer address of the client connection.
    pub client_ip: Option<IpAddr>,
}

/// An HTTP request handler: one middleware link or a terminal service.
#[async_trait]
pub trait HttpHandler: Send + Sync {
    async fn handle(&self, req: Request) -> Response;
}

/// `next -> wrapped` composition produced by the middleware factory.
pub type MiddlewareLayer = Arc<dyn Fn(SharedHandler) -> SharedHandler + Send + Sync>;

/// An empty body.
pub fn empty_body() -> Body {
    Empty::new().map_err(|never| match never {}).boxed()
}

/// A body carrying `bytes`.
pub fn full_body(bytes: impl Into<Bytes>) -> Body {
    Full::new(bytes.into()).map_err(|never| match never {}).boxed()
}

/// A bare status response with no body.
pub fn status_response(status: StatusCode) -> Response {
    let mut response = http::Response::new(empty_body());
    *response.status_mut() = status;
    response
}

/// The client connection's context for a request, read by `ClientIP`
/// matchers and IP-based middlewares.
pub fn client_ip(req: &Request) -> Option<IpAddr> {
    req.extensions()
        .get::<RequestContext>()
        .and_then(|ctx| ctx.client_ip)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_response_has_no_body() {
        let response = status_response(StatusCode::NOT_FOUND);
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }
}
