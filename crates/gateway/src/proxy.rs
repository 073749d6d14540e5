//! Upstream forwarding over a pooled hyper client.
//!
//! Each load balancer owns one client (and with it one connection pool);
//! pools close when the owning runtime is dropped at the end of its drain.

use std::pin::Pin;
use std::sync::atomic::AtomicBool;
use std::task::{Context, Poll};

use bytes::Bytes;
use http::uri::{Authority, PathAndQuery, Scheme};
use http::{StatusCode, Uri, header};
use http_body_util::BodyExt;
use hyper_util::client::legacy::Client;
use hyper_util::client::legacy::connect::HttpConnector;
use hyper_util::rt::TokioExecutor;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use crate::error::BuildError;
use crate::handler::{Body, BoxError, Request, Response, status_response};

/// One upstream server of a load balancer.
#[derive(Debug)]
pub struct Upstream {
    /// Scheme of the server URL.
    pub scheme: Scheme,
    /// Authority (`host:port`) of the server URL.
    pub authority: Authority,
    /// Path prefix of the server URL, empty for `/`.
    pub base_path: String,
    /// Effective weight, at least 1.
    pub weight: i64,
    /// Flipped by the health check loop; unhealthy servers are skipped.
    pub healthy: AtomicBool,
}

impl Upstream {
    /// Parse a configured server URL.
    pub fn parse(url: &str, weight: i64) -> Result<Self, BuildError> {
        let uri: Uri = url
            .parse()
            .map_err(|e| BuildError::BadUpstream(url.to_owned(), format!("{e}")))?;
        let scheme = uri.scheme().cloned().unwrap_or(Scheme::HTTP);
        let authority = uri
            .authority()
            .cloned()
            .ok_or_else(|| BuildError::BadUpstream(url.to_owned(), "missing authority".to_owned()))?;
        let base_path = uri.path().trim_end_matches('/').to_owned();
        Ok(Self {
            scheme,
            authority,
            base_path,
            weight: weight.max(1),
            healthy: AtomicBool::new(true),
        })
    }

    /// The URI for a request with `path_and_query` against this upstream.
    fn target(&self, path_and_query: &str) -> Result<Uri, http::Error> {
        let pq = if self.base_path.is_empty() {
            path_and_query.to_owned()
        } else {
            format!("{}{}", self.base_path, path_and_query)
        };
        Uri::builder()
            .scheme(self.scheme.clone())
            .authority(self.authority.clone())
            .path_and_query(pq)
            .build()
    }
}

/// Pooled client shared by one service's upstreams.
pub struct ProxyClient {
    client: Client<HttpConnector, Body>,
}

impl Default for ProxyClient {
    fn default() -> Self {
        Self::new()
    }
}

impl ProxyClient {
    pub fn new() -> Self {
        Self {
            client: Client::builder(TokioExecutor::new()).build_http(),
        }
    }

    /// Forward `req` to `upstream`, translating failures into gateway
    /// responses: 502 for transport errors, 503 once `hard_cancel` fires
    /// (the owning runtime is past its drain grace).
    pub async fn forward(
        &self,
        req: Request,
        upstream: &Upstream,
        pass_host_header: bool,
        hard_cancel: &CancellationToken,
    ) -> Response {
        let (mut parts, body) = req.into_parts();

        let path_and_query = parts
            .uri
            .path_and_query()
            .map_or("/", PathAndQuery::as_str)
            .to_owned();
        parts.uri = match upstream.target(&path_and_query) {
            Ok(uri) => uri,
            Err(e) => {
                warn!(error = %e, "failed to build upstream uri");
                return status_response(StatusCode::BAD_GATEWAY);
            }
        };
        if !pass_host_header {
            // The client fills Host from the upstream authority.
            parts.headers.remove(header::HOST);
        }

        let request = http::Request::from_parts(parts, body);
        tokio::select! {
            () = hard_cancel.cancelled() => status_response(StatusCode::SERVICE_UNAVAILABLE),
            result = self.client.request(request) => match result {
                Ok(response) => response.map(|b| b.map_err(BoxError::from).boxed()),
                Err(e) => {
                    warn!(upstream = %upstream.authority, error = %e, "upstream request failed");
                    status_response(StatusCode::BAD_GATEWAY)
                }
            },
        }
    }
}

/// A body that yields a buffered prefix before the remaining stream.
///
/// Used by mirroring when a request body exceeds the mirror buffer: the
/// primary still receives the full body, reassembled from the buffered
/// prefix plus the unread remainder.
pub struct PrefixedBody {
    prefix: Option<Bytes>,
    rest: Body,
}

impl PrefixedBody {
    pub fn new(prefix: Bytes, rest: Body) -> Self {
        Self {
            prefix: (!prefix.is_empty()).then_some(prefix),
            rest,
        }
    }
}

impl http_body::Body for PrefixedBody {
    type Data = Bytes;
    type Error = BoxError;

    fn poll_frame(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Option<Result<http_body::Frame<Bytes>, BoxError>>> {
        if let Some(prefix) = self.prefix.take() {
            return Poll::Ready(Some(Ok(http_body::Frame::data(prefix))));
        }
        Pin::new(&mut self.rest).poll_frame(cx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_upstream_url() {
        let upstream = Upstream::parse("http://10.0.0.7:8080", 0).unwrap();
        assert_eq!(upstream.authority.as_str(), "10.0.0.7:8080");
        assert_eq!(upstream.base_path, "");
        assert_eq!(upstream.weight, 1);
    }

    #[test]
    fn parse_upstream_with_base_path() {
        let upstream = Upstream::parse("http://u1/base/", 2).unwrap();
        assert_eq!(upstream.base_path, "/base");
        let target = upstream.target("/x?q=1").unwrap();
        assert_eq!(target.path_and_query().unwrap().as_str(), "/base/x?q=1");
    }

    #[test]
    fn parse_rejects_garbage() {
        assert!(Upstream::parse("not a url", 1).is_err());
        assert!(Upstream::parse("/relative/only", 1).is_err());
    }

    #[tokio::test]
    async fn prefixed_body_replays_prefix_first() {
        use http_body_util::BodyExt;

        let rest = crate::handler::full_body("tail");
        let body = PrefixedBody::new(Bytes::from_static(b"head-"), rest);
        let collected = BodyExt::collect(body).await.unwrap().to_bytes();
        assert_eq!(&collected[..], b"head-tail");
    }
}
