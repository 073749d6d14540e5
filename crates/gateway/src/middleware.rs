//! Middleware factory and the implemented middleware bodies.
//!
//! A built middleware is a [`MiddlewareLayer`]: `next -> wrapped`. The
//! factory instantiates handlers by variant tag; variants outside the
//! implemented set produce a per-entity build error when referenced.
//! Chain middlewares expand at build time into the composition of their
//! members, first listed outermost.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use async_trait::async_trait;
use http::uri::PathAndQuery;
use http::{HeaderName, HeaderValue, StatusCode, header};
use ipnet::IpNet;

use fluxgate_core::config::{
    AddPrefix, HeadersConfig, InFlightReq, IpAllowList, Middleware, RedirectScheme, StripPrefix,
};
use fluxgate_rules::compile_cidrs;

use crate::error::BuildError;
use crate::handler::{
    HttpHandler, MiddlewareLayer, Request, Response, SharedHandler, full_body, status_response,
};

/// Memoizing factory over the snapshot's middleware definitions.
pub struct MiddlewareFactory<'a> {
    definitions: &'a BTreeMap<String, Middleware>,
    built: BTreeMap<String, MiddlewareLayer>,
}

impl<'a> MiddlewareFactory<'a> {
    pub fn new(definitions: &'a BTreeMap<String, Middleware>) -> Self {
        Self {
            definitions,
            built: BTreeMap::new(),
        }
    }

    /// Resolve `name` to a built layer, building it on first use.
    ///
    /// Chains recurse; cycles cannot occur because validation removed them.
    pub fn resolve(&mut self, name: &str) -> Result<MiddlewareLayer, BuildError> {
        if let Some(layer) = self.built.get(name) {
            return Ok(Arc::clone(layer));
        }
        let definition = self
            .definitions
            .get(name)
            .ok_or_else(|| BuildError::MiddlewareNotFound(name.to_owned()))?;
        let layer = self.build(definition)?;
        self.built.insert(name.to_owned(), Arc::clone(&layer));
        Ok(layer)
    }

    fn build(&mut self, definition: &Middleware) -> Result<MiddlewareLayer, BuildError> {
        match definition {
            Middleware::AddPrefix(cfg) => Ok(add_prefix_layer(cfg)),
            Middleware::StripPrefix(cfg) => Ok(strip_prefix_layer(cfg)),
            Middleware::Headers(cfg) => headers_layer(cfg),
            Middleware::RedirectScheme(cfg) => Ok(redirect_scheme_layer(cfg)),
            Middleware::IpAllowList(cfg) => ip_allow_list_layer(cfg),
            Middleware::InFlightReq(cfg) => Ok(in_flight_layer(cfg)),
            Middleware::Chain(cfg) => {
                let mut layers = Vec::with_capacity(cfg.middlewares.len());
                for member in &cfg.middlewares {
                    layers.push(self.resolve(member)?);
                }
                Ok(Arc::new(move |next: SharedHandler| {
                    // First listed outermost: wrap from the inside out.
                    layers
                        .iter()
                        .rev()
                        .fold(next, |handler, layer| layer(handler))
                }))
            }
            other => Err(BuildError::UnsupportedMiddleware(other.kind())),
        }
    }
}

/// Compose `layers` around `inner`, first listed outermost.
pub fn compose(layers: &[MiddlewareLayer], inner: SharedHandler) -> SharedHandler {
    layers.iter().rev().fold(inner, |handler, layer| layer(handler))
}

// ---------------------------------------------------------------------------
// AddPrefix
// ---------------------------------------------------------------------------

struct AddPrefixHandler {
    prefix: String,
    next: SharedHandler,
}

#[async_trait]
impl HttpHandler for AddPrefixHandler {
    async fn handle(&self, req: Request) -> Response {
        let path = req.uri().path();
        let joined = format!("{}{}", self.prefix, path);
        let req = with_path(req, &joined);
        self.next.handle(req).await
    }
}

fn add_prefix_layer(cfg: &AddPrefix) -> MiddlewareLayer {
    let prefix = cfg.prefix.trim_end_matches('/').to_owned();
    Arc::new(move |next| {
        Arc::new(AddPrefixHandler {
            prefix: prefix.clone(),
            next,
        }) as SharedHandler
    })
}

// ---------------------------------------------------------------------------
// StripPrefix
// ---------------------------------------------------------------------------

/// Header recording the prefix removed from the forwarded path.
const X_FORWARDED_PREFIX: &str = "x-forwarded-prefix";

struct StripPrefixHandler {
    prefixes: Vec<String>,
    next: SharedHandler,
}

#[async_trait]
impl HttpHandler for StripPrefixHandler {
    async fn handle(&self, req: Request) -> Response {
        let path = req.uri().path().to_owned();
        for prefix in &self.prefixes {
            if let Some(rest) = strip_segment_prefix(&path, prefix) {
                let mut req = with_path(req, &rest);
                if let Ok(value) = HeaderValue::from_str(prefix) {
                    req.headers_mut()
                        .insert(HeaderName::from_static(X_FORWARDED_PREFIX), value);
                }
                return self.next.handle(req).await;
            }
        }
        self.next.handle(req).await
    }
}

/// `/api` strips from `/api` and `/api/x`, never from `/apix`.
fn strip_segment_prefix(path: &str, prefix: &str) -> Option<String> {
    let prefix = prefix.trim_end_matches('/');
    match path.strip_prefix(prefix) {
        Some("") => Some("/".to_owned()),
        Some(rest) if rest.starts_with('/') => Some(rest.to_owned()),
        _ => None,
    }
}

fn strip_prefix_layer(cfg: &StripPrefix) -> MiddlewareLayer {
    let prefixes = cfg.prefixes.clone();
    Arc::new(move |next| {
        Arc::new(StripPrefixHandler {
            prefixes: prefixes.clone(),
            next,
        }) as SharedHandler
    })
}

// ---------------------------------------------------------------------------
// Headers
// ---------------------------------------------------------------------------

type HeaderEdit = (HeaderName, Option<HeaderValue>);

struct HeadersHandler {
    request: Vec<HeaderEdit>,
    response: Vec<HeaderEdit>,
    next: SharedHandler,
}

#[async_trait]
impl HttpHandler for HeadersHandler {
    async fn handle(&self, mut req: Request) -> Response {
        apply_edits(req.headers_mut(), &self.request);
        let mut response = self.next.handle(req).await;
        apply_edits(response.headers_mut(), &self.response);
        response
    }
}

fn apply_edits(headers: &mut http::HeaderMap, edits: &[HeaderEdit]) {
    for (name, value) in edits {
        match value {
            // An empty configured value deletes the header.
            None => {
                headers.remove(name);
            }
            Some(value) => {
                headers.insert(name.clone(), value.clone());
            }
        }
    }
}

fn compile_edits(map: &BTreeMap<String, String>) -> Result<Vec<HeaderEdit>, BuildError> {
    map.iter()
        .map(|(name, value)| {
            let name: HeaderName = name
                .parse()
                .map_err(|e| BuildError::BadHeader(name.clone(), format!("{e}")))?;
            if value.is_empty() {
                Ok((name, None))
            } else {
                let value: HeaderValue = value
                    .parse()
                    .map_err(|e| BuildError::BadHeader(value.clone(), format!("{e}")))?;
                Ok((name, Some(value)))
            }
        })
        .collect()
}

fn headers_layer(cfg: &HeadersConfig) -> Result<MiddlewareLayer, BuildError> {
    let request = compile_edits(&cfg.custom_request_headers)?;
    let response = compile_edits(&cfg.custom_response_headers)?;
    Ok(Arc::new(move |next| {
        Arc::new(HeadersHandler {
            request: request.clone(),
            response: response.clone(),
            next,
        }) as SharedHandler
    }))
}

// ---------------------------------------------------------------------------
// RedirectScheme
// ---------------------------------------------------------------------------

struct RedirectSchemeHandler {
    scheme: String,
    port: Option<String>,
    status: StatusCode,
}

#[async_trait]
impl HttpHandler for RedirectSchemeHandler {
    async fn handle(&self, req: Request) -> Response {
        let host = req
            .headers()
            .get(header::HOST)
            .and_then(|v| v.to_str().ok())
            .map(|h| h.split(':').next().unwrap_or(h).to_owned())
            .or_else(|| req.uri().host().map(str::to_owned))
            .unwrap_or_default();
        let port = self
            .port
            .as_ref()
            .map(|p| format!(":{p}"))
            .unwrap_or_default();
        let path = req
            .uri()
            .path_and_query()
            .map_or("/", PathAndQuery::as_str);
        let location = format!("{}://{host}{port}{path}", self.scheme);

        let mut response = status_response(self.status);
        if let Ok(value) = HeaderValue::from_str(&location) {
            response.headers_mut().insert(header::LOCATION, value);
        }
        response
    }
}

fn redirect_scheme_layer(cfg: &RedirectScheme) -> MiddlewareLayer {
    let scheme = cfg.scheme.clone();
    let port = cfg.port.clone();
    let status = if cfg.permanent {
        StatusCode::MOVED_PERMANENTLY
    } else {
        StatusCode::FOUND
    };
    Arc::new(move |_next| {
        Arc::new(RedirectSchemeHandler {
            scheme: scheme.clone(),
            port: port.clone(),
            status,
        }) as SharedHandler
    })
}

// ---------------------------------------------------------------------------
// IPAllowList
// ---------------------------------------------------------------------------

struct IpAllowListHandler {
    nets: Vec<IpNet>,
    next: SharedHandler,
}

#[async_trait]
impl HttpHandler for IpAllowListHandler {
    async fn handle(&self, req: Request) -> Response {
        let allowed = crate::handler::client_ip(&req)
            .is_some_and(|ip| self.nets.iter().any(|net| net.contains(&ip)));
        if allowed {
            self.next.handle(req).await
        } else {
            status_response(StatusCode::FORBIDDEN)
        }
    }
}

fn ip_allow_list_layer(cfg: &IpAllowList) -> Result<MiddlewareLayer, BuildError> {
    let nets = compile_cidrs("IPAllowList", &cfg.source_range)?;
    Ok(Arc::new(move |next| {
        Arc::new(IpAllowListHandler {
            nets: nets.clone(),
            next,
        }) as SharedHandler
    }))
}

// ---------------------------------------------------------------------------
// InFlightReq
// ---------------------------------------------------------------------------

struct InFlightHandler {
    limit: u64,
    current: Arc<AtomicU64>,
    next: SharedHandler,
}

struct InFlightGuard(Arc<AtomicU64>);

impl Drop for InFlightGuard {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::Relaxed);
    }
}

#[async_trait]
impl HttpHandler for InFlightHandler {
    async fn handle(&self, req: Request) -> Response {
        if self.current.fetch_add(1, Ordering::Relaxed) >= self.limit {
            self.current.fetch_sub(1, Ordering::Relaxed);
            let mut response = status_response(StatusCode::TOO_MANY_REQUESTS);
            *response.body_mut() = full_body("too many requests in flight");
            return response;
        }
        let _guard = InFlightGuard(Arc::clone(&self.current));
        self.next.handle(req).await
    }
}

fn in_flight_layer(cfg: &InFlightReq) -> MiddlewareLayer {
    let limit = cfg.amount;
    // One shared counter across every chain this middleware appears in.
    let current = Arc::new(AtomicU64::new(0));
    Arc::new(move |next| {
        Arc::new(InFlightHandler {
            limit,
            current: Arc::clone(&current),
            next,
        }) as SharedHandler
    })
}

// ---------------------------------------------------------------------------

/// Rebuild the request URI with a new path, keeping the query.
fn with_path(req: Request, path: &str) -> Request {
    let (mut parts, body) = req.into_parts();
    let path = if path.is_empty() { "/" } else { path };
    let pq = match parts.uri.query() {
        Some(query) => format!("{path}?{query}"),
        None => path.to_owned(),
    };
    let mut uri_parts = std::mem::take(&mut parts.uri).into_parts();
    if let Ok(pq) = pq.parse::<PathAndQuery>() {
        uri_parts.path_and_query = Some(pq);
    }
    if let Ok(uri) = http::Uri::from_parts(uri_parts) {
        parts.uri = uri;
    }
    Request::from_parts(parts, body)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::{RequestContext, empty_body};
    use fluxgate_core::config::Chain;
    use std::net::IpAddr;

    /// Terminal handler echoing the request path (and one header) back.
    struct Echo;

    #[async_trait]
    impl HttpHandler for Echo {
        async fn handle(&self, req: Request) -> Response {
            let mut response = status_response(StatusCode::OK);
            let path = req.uri().path().to_owned();
            if let Ok(value) = HeaderValue::from_str(&path) {
                response.headers_mut().insert("x-echo-path", value);
            }
            if let Some(value) = req.headers().get(X_FORWARDED_PREFIX) {
                response
                    .headers_mut()
                    .insert("x-echo-forwarded-prefix", value.clone());
            }
            response
        }
    }

    fn request(path: &str) -> Request {
        http::Request::builder()
            .uri(format!("http://a.test{path}"))
            .body(empty_body())
            .unwrap()
    }

    fn request_from(path: &str, ip: &str) -> Request {
        let mut req = request(path);
        req.extensions_mut().insert(RequestContext {
            router: "r@file".to_owned(),
            service: "s@file".to_owned(),
            entry_point: "web".to_owned(),
            client_ip: Some(ip.parse::<IpAddr>().unwrap()),
        });
        req
    }

    fn definitions(entries: &[(&str, Middleware)]) -> BTreeMap<String, Middleware> {
        entries
            .iter()
            .map(|(k, v)| ((*k).to_owned(), v.clone()))
            .collect()
    }

    #[tokio::test]
    async fn strip_prefix_rewrites_path() {
        let defs = definitions(&[(
            "sp@file",
            Middleware::StripPrefix(StripPrefix {
                prefixes: vec!["/api".to_owned()],
            }),
        )]);
        let mut factory = MiddlewareFactory::new(&defs);
        let layer = factory.resolve("sp@file").unwrap();
        let handler = layer(Arc::new(Echo));

        let response = handler.handle(request("/api/x")).await;
        assert_eq!(response.headers()["x-echo-path"], "/x");
        assert_eq!(response.headers()["x-echo-forwarded-prefix"], "/api");

        let response = handler.handle(request("/api")).await;
        assert_eq!(response.headers()["x-echo-path"], "/");

        // Non-matching paths pass through untouched.
        let response = handler.handle(request("/apix")).await;
        assert_eq!(response.headers()["x-echo-path"], "/apix");
    }

    #[tokio::test]
    async fn add_prefix_prepends() {
        let defs = definitions(&[(
            "ap@file",
            Middleware::AddPrefix(AddPrefix {
                prefix: "/v1".to_owned(),
            }),
        )]);
        let mut factory = MiddlewareFactory::new(&defs);
        let handler = factory.resolve("ap@file").unwrap()(Arc::new(Echo));

        let response = handler.handle(request("/x")).await;
        assert_eq!(response.headers()["x-echo-path"], "/v1/x");
    }

    #[tokio::test]
    async fn chain_composes_first_listed_outermost() {
        let defs = definitions(&[
            (
                "outer@file",
                Middleware::StripPrefix(StripPrefix {
                    prefixes: vec!["/api".to_owned()],
                }),
            ),
            (
                "inner@file",
                Middleware::AddPrefix(AddPrefix {
                    prefix: "/backend".to_owned(),
                }),
            ),
            (
                "chain@file",
                Middleware::Chain(Chain {
                    middlewares: vec!["outer@file".to_owned(), "inner@file".to_owned()],
                }),
            ),
        ]);
        let mut factory = MiddlewareFactory::new(&defs);
        let handler = factory.resolve("chain@file").unwrap()(Arc::new(Echo));

        // Strip runs first (outermost), then add: /api/x -> /x -> /backend/x.
        let response = handler.handle(request("/api/x")).await;
        assert_eq!(response.headers()["x-echo-path"], "/backend/x");
    }

    #[tokio::test]
    async fn ip_allow_list_gates_by_client_ip() {
        let defs = definitions(&[(
            "allow@file",
            Middleware::IpAllowList(IpAllowList {
                source_range: vec!["10.0.0.0/8".to_owned()],
            }),
        )]);
        let mut factory = MiddlewareFactory::new(&defs);
        let handler = factory.resolve("allow@file").unwrap()(Arc::new(Echo));

        let ok = handler.handle(request_from("/", "10.1.2.3")).await;
        assert_eq!(ok.status(), StatusCode::OK);

        let blocked = handler.handle(request_from("/", "192.168.1.1")).await;
        assert_eq!(blocked.status(), StatusCode::FORBIDDEN);

        // No client context at all is also a denial.
        let anonymous = handler.handle(request("/")).await;
        assert_eq!(anonymous.status(), StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn redirect_scheme_short_circuits() {
        let defs = definitions(&[(
            "https@file",
            Middleware::RedirectScheme(RedirectScheme {
                scheme: "https".to_owned(),
                port: None,
                permanent: true,
            }),
        )]);
        let mut factory = MiddlewareFactory::new(&defs);
        let handler = factory.resolve("https@file").unwrap()(Arc::new(Echo));

        let mut req = request("/x?q=1");
        req.headers_mut()
            .insert(header::HOST, HeaderValue::from_static("a.test"));
        let response = handler.handle(req).await;
        assert_eq!(response.status(), StatusCode::MOVED_PERMANENTLY);
        assert_eq!(response.headers()[header::LOCATION], "https://a.test/x?q=1");
    }

    #[tokio::test]
    async fn headers_edit_request_and_response() {
        let mut request_headers = BTreeMap::new();
        request_headers.insert("X-Env".to_owned(), "prod".to_owned());
        let mut response_headers = BTreeMap::new();
        response_headers.insert("Server".to_owned(), "fluxgate".to_owned());
        let defs = definitions(&[(
            "h@file",
            Middleware::Headers(HeadersConfig {
                custom_request_headers: request_headers,
                custom_response_headers: response_headers,
            }),
        )]);
        let mut factory = MiddlewareFactory::new(&defs);
        let handler = factory.resolve("h@file").unwrap()(Arc::new(Echo));

        let response = handler.handle(request("/")).await;
        assert_eq!(response.headers()["server"], "fluxgate");
    }

    #[tokio::test]
    async fn in_flight_req_rejects_over_limit() {
        let defs = definitions(&[(
            "cap@file",
            Middleware::InFlightReq(InFlightReq { amount: 0 }),
        )]);
        let mut factory = MiddlewareFactory::new(&defs);
        let handler = factory.resolve("cap@file").unwrap()(Arc::new(Echo));

        let response = handler.handle(request("/")).await;
        assert_eq!(response.status(), StatusCode::TOO_MANY_REQUESTS);
    }

    #[test]
    fn unknown_reference_reports_exact_name() {
        let defs = definitions(&[]);
        let mut factory = MiddlewareFactory::new(&defs);
        let err = match factory.resolve("missing@file") {
            Err(e) => e,
            Ok(_) => panic!("expected an error"),
        };
        assert_eq!(err.to_string(), r#"middleware "missing@file" not found"#);
    }

    #[test]
    fn unsupported_variant_is_a_build_error() {
        let defs = definitions(&[(
            "retry@file",
            Middleware::Retry(fluxgate_core::config::Retry::default()),
        )]);
        let mut factory = MiddlewareFactory::new(&defs);
        let err = match factory.resolve("retry@file") {
            Err(e) => e,
            Ok(_) => panic!("expected an error"),
        };
        assert!(matches!(err, BuildError::UnsupportedMiddleware("retry")));
    }
}
