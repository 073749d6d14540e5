//! HTTP configuration: routers, services and middlewares.
//!
//! Serde note: the canonical wire form is camelCase; every structural key
//! also accepts its all-lowercase spelling because KV and label providers
//! are case-insensitive on structural segments. Scalar fields accept both
//! native JSON scalars and their string forms (see [`flex`](super::flex)).

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::flex;

/// The HTTP section of a configuration tree.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HttpConfig {
    /// Routers keyed by name.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub routers: BTreeMap<String, Router>,
    /// Services keyed by name.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub services: BTreeMap<String, Service>,
    /// Middlewares keyed by name.
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub middlewares: BTreeMap<String, Middleware>,
}

/// A single HTTP router: a rule scoped to entry points, pointing at one
/// service through an ordered middleware chain.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Router {
    /// Entry points this router listens on. Empty means all HTTP entry points.
    #[serde(alias = "entrypoints", skip_serializing_if = "Vec::is_empty")]
    pub entry_points: Vec<String>,
    /// The matcher rule, e.g. ``Host(`a.test`) && PathPrefix(`/api`)``.
    pub rule: String,
    /// Explicit priority; `0` means "derive from rule length".
    #[serde(deserialize_with = "flex::lenient")]
    pub priority: i32,
    /// Middleware names applied in declared order, first listed outermost.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub middlewares: Vec<String>,
    /// The service handling matched requests.
    pub service: String,
    /// TLS settings; `Some` means the router only matches TLS traffic.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls: Option<RouterTls>,
    /// Per-router observability toggles.
    pub observability: Observability,
}

impl Default for Router {
    fn default() -> Self {
        Self {
            entry_points: Vec::new(),
            rule: String::new(),
            priority: 0,
            middlewares: Vec::new(),
            service: String::new(),
            tls: None,
            observability: Observability::default(),
        }
    }
}

/// TLS options attached to a router.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RouterTls {
    /// Named TLS options to apply (resolved outside the core).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub options: Option<String>,
    /// Certificate domains requested for this router.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub domains: Vec<Domain>,
}

/// A certificate domain with optional SANs.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Domain {
    /// The main domain name.
    pub main: String,
    /// Subject alternative names.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub sans: Vec<String>,
}

/// Per-router observability toggles, all on by default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Observability {
    #[serde(alias = "accesslogs", deserialize_with = "flex::lenient")]
    pub access_logs: bool,
    #[serde(deserialize_with = "flex::lenient")]
    pub tracing: bool,
    #[serde(deserialize_with = "flex::lenient")]
    pub metrics: bool,
}

impl Default for Observability {
    fn default() -> Self {
        Self {
            access_logs: true,
            tracing: true,
            metrics: true,
        }
    }
}

/// An HTTP service, exactly one flavor per entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Service {
    /// Real upstreams behind a load-balancing reverse proxy.
    #[serde(alias = "loadbalancer")]
    LoadBalancer(LoadBalancer),
    /// Composite service selecting among children by weight.
    #[serde(alias = "weighted")]
    Weighted(Weighted),
    /// Tee: forward to a primary, clone a share of traffic to mirrors.
    #[serde(alias = "mirroring")]
    Mirroring(Mirroring),
}

/// Load balancer over a set of upstream servers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LoadBalancer {
    /// Upstream servers.
    pub servers: Vec<Server>,
    /// Selection strategy; only `"wrr"` (weighted round-robin) is defined.
    pub strategy: String,
    /// Optional active health checking.
    #[serde(alias = "healthcheck", skip_serializing_if = "Option::is_none")]
    pub health_check: Option<HealthCheck>,
    /// Optional sticky-cookie session affinity.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sticky: Option<Sticky>,
    /// Forward the client's Host header upstream (default) or rewrite it.
    #[serde(alias = "passhostheader", deserialize_with = "flex::lenient")]
    pub pass_host_header: bool,
}

impl Default for LoadBalancer {
    fn default() -> Self {
        Self {
            servers: Vec::new(),
            strategy: "wrr".to_owned(),
            health_check: None,
            sticky: None,
            pass_host_header: true,
        }
    }
}

/// One upstream server of a load balancer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Server {
    /// Upstream base URL, e.g. `http://10.0.0.7:8080`.
    pub url: String,
    /// Relative weight for weighted round-robin.
    #[serde(deserialize_with = "flex::lenient", skip_serializing_if = "is_zero_i64")]
    pub weight: i64,
}

fn is_zero_i64(v: &i64) -> bool {
    *v == 0
}

/// Active health checking of load-balancer upstreams.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HealthCheck {
    /// Probe path.
    pub path: String,
    /// Seconds between probes.
    #[serde(deserialize_with = "flex::lenient")]
    pub interval: u64,
    /// Probe timeout in seconds.
    #[serde(deserialize_with = "flex::lenient")]
    pub timeout: u64,
    /// Probe a different port than the server URL's.
    #[serde(default, deserialize_with = "flex::lenient_opt", skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    /// Exact status code expected; any 2xx/3xx when unset.
    #[serde(default, deserialize_with = "flex::lenient_opt", skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
}

impl Default for HealthCheck {
    fn default() -> Self {
        Self {
            path: "/".to_owned(),
            interval: 30,
            timeout: 5,
            port: None,
            status: None,
        }
    }
}

/// Sticky-session settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Sticky {
    /// Cookie-based affinity.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cookie: Option<StickyCookie>,
}

/// The affinity cookie.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StickyCookie {
    /// Cookie name.
    pub name: String,
    #[serde(deserialize_with = "flex::lenient")]
    pub secure: bool,
    #[serde(alias = "httponly", deserialize_with = "flex::lenient")]
    pub http_only: bool,
}

impl Default for StickyCookie {
    fn default() -> Self {
        Self {
            name: "fluxgate_affinity".to_owned(),
            secure: false,
            http_only: true,
        }
    }
}

/// Composite service whose children are picked by weight per request.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Weighted {
    /// Child services with weights.
    pub services: Vec<WeightedItem>,
    /// Optional sticky-cookie affinity across children.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sticky: Option<Sticky>,
}

/// One weighted child.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct WeightedItem {
    /// Referenced service name.
    pub name: String,
    /// Non-negative weight; `0` removes the child from selection.
    #[serde(deserialize_with = "flex::lenient")]
    pub weight: i64,
}

impl Default for WeightedItem {
    fn default() -> Self {
        Self {
            name: String::new(),
            weight: 1,
        }
    }
}

/// Mirroring service: the client only ever sees the primary's response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Mirroring {
    /// The primary service receiving the original request.
    pub service: String,
    /// Mirror targets and the share of requests cloned to each.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub mirrors: Vec<Mirror>,
    /// Largest request body buffered for cloning; `-1` means unlimited.
    #[serde(alias = "maxbodysize", deserialize_with = "flex::lenient")]
    pub max_body_size: i64,
}

impl Default for Mirroring {
    fn default() -> Self {
        Self {
            service: String::new(),
            mirrors: Vec::new(),
            max_body_size: -1,
        }
    }
}

/// One mirror target.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Mirror {
    /// Referenced service name.
    pub name: String,
    /// Percentage of requests cloned to this mirror (0-100).
    #[serde(deserialize_with = "flex::lenient")]
    pub percent: i64,
}

impl Default for Mirror {
    fn default() -> Self {
        Self {
            name: String::new(),
            percent: 100,
        }
    }
}

/// A middleware definition, tagged by variant.
///
/// The build step instantiates handlers from these variants; variants
/// without a handler implementation produce a per-entity build error when
/// referenced, never a failed build.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Middleware {
    #[serde(alias = "addprefix")]
    AddPrefix(AddPrefix),
    #[serde(alias = "stripprefix")]
    StripPrefix(StripPrefix),
    #[serde(alias = "basicauth")]
    BasicAuth(BasicAuth),
    #[serde(alias = "headers")]
    Headers(HeadersConfig),
    #[serde(alias = "ratelimit")]
    RateLimit(RateLimit),
    #[serde(alias = "retry")]
    Retry(Retry),
    #[serde(alias = "chain")]
    Chain(Chain),
    #[serde(alias = "circuitbreaker")]
    CircuitBreaker(CircuitBreaker),
    #[serde(alias = "forwardauth")]
    ForwardAuth(ForwardAuth),
    #[serde(alias = "compress")]
    Compress(Compress),
    #[serde(alias = "ipallowlist")]
    IpAllowList(IpAllowList),
    #[serde(alias = "redirectscheme")]
    RedirectScheme(RedirectScheme),
    #[serde(alias = "redirectregex")]
    RedirectRegex(RedirectRegex),
    #[serde(alias = "replacepath")]
    ReplacePath(ReplacePath),
    #[serde(alias = "replacepathregex")]
    ReplacePathRegex(ReplacePathRegex),
    #[serde(alias = "buffering")]
    Buffering(Buffering),
    #[serde(alias = "inflightreq")]
    InFlightReq(InFlightReq),
    #[serde(rename = "passTLSClientCert", alias = "passtlsclientcert")]
    PassTlsClientCert(PassTlsClientCert),
    #[serde(alias = "plugin")]
    Plugin(BTreeMap<String, serde_json::Value>),
}

impl Middleware {
    /// The variant tag as it appears in configuration.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::AddPrefix(_) => "addPrefix",
            Self::StripPrefix(_) => "stripPrefix",
            Self::BasicAuth(_) => "basicAuth",
            Self::Headers(_) => "headers",
            Self::RateLimit(_) => "rateLimit",
            Self::Retry(_) => "retry",
            Self::Chain(_) => "chain",
            Self::CircuitBreaker(_) => "circuitBreaker",
            Self::ForwardAuth(_) => "forwardAuth",
            Self::Compress(_) => "compress",
            Self::IpAllowList(_) => "ipAllowList",
            Self::RedirectScheme(_) => "redirectScheme",
            Self::RedirectRegex(_) => "redirectRegex",
            Self::ReplacePath(_) => "replacePath",
            Self::ReplacePathRegex(_) => "replacePathRegex",
            Self::Buffering(_) => "buffering",
            Self::InFlightReq(_) => "inFlightReq",
            Self::PassTlsClientCert(_) => "passTLSClientCert",
            Self::Plugin(_) => "plugin",
        }
    }
}

/// Prepend a fixed prefix to the request path.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AddPrefix {
    pub prefix: String,
}

/// Strip any of the listed prefixes from the request path.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct StripPrefix {
    pub prefixes: Vec<String>,
}

/// HTTP basic authentication.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BasicAuth {
    /// `user:hashed-password` entries.
    pub users: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub realm: Option<String>,
}

/// Static request/response header manipulation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct HeadersConfig {
    /// Headers set on the upstream request; empty value deletes the header.
    #[serde(alias = "customrequestheaders", skip_serializing_if = "BTreeMap::is_empty")]
    pub custom_request_headers: BTreeMap<String, String>,
    /// Headers set on the downstream response; empty value deletes.
    #[serde(alias = "customresponseheaders", skip_serializing_if = "BTreeMap::is_empty")]
    pub custom_response_headers: BTreeMap<String, String>,
}

/// Token-bucket request rate limiting.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RateLimit {
    /// Sustained requests per period.
    #[serde(deserialize_with = "flex::lenient")]
    pub average: u64,
    /// Burst capacity.
    #[serde(deserialize_with = "flex::lenient")]
    pub burst: u64,
    /// Period in seconds the average applies to.
    #[serde(deserialize_with = "flex::lenient")]
    pub period: u64,
}

impl Default for RateLimit {
    fn default() -> Self {
        Self {
            average: 0,
            burst: 1,
            period: 1,
        }
    }
}

/// Retry failed upstream attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Retry {
    #[serde(deserialize_with = "flex::lenient")]
    pub attempts: u32,
    /// Initial backoff in milliseconds, doubled per attempt.
    #[serde(alias = "initialinterval", rename = "initialInterval", deserialize_with = "flex::lenient")]
    pub initial_interval: u64,
}

impl Default for Retry {
    fn default() -> Self {
        Self {
            attempts: 1,
            initial_interval: 100,
        }
    }
}

/// Reusable ordered group of middlewares.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Chain {
    pub middlewares: Vec<String>,
}

/// Circuit breaker guarding a service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CircuitBreaker {
    /// Trip expression, e.g. `NetworkErrorRatio() > 0.5`.
    pub expression: String,
}

/// Delegate the auth decision to an external service.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ForwardAuth {
    pub address: String,
    #[serde(alias = "trustforwardheader", deserialize_with = "flex::lenient")]
    pub trust_forward_header: bool,
    #[serde(alias = "authresponseheaders", skip_serializing_if = "Vec::is_empty")]
    pub auth_response_headers: Vec<String>,
}

/// Response compression.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Compress {
    #[serde(alias = "excludedcontenttypes", skip_serializing_if = "Vec::is_empty")]
    pub excluded_content_types: Vec<String>,
}

/// Allow only clients whose IP falls in one of the source ranges.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct IpAllowList {
    /// CIDR ranges; bare addresses are treated as /32 (or /128).
    #[serde(alias = "sourcerange")]
    pub source_range: Vec<String>,
}

/// Redirect to a different scheme (typically http -> https).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RedirectScheme {
    pub scheme: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<String>,
    #[serde(deserialize_with = "flex::lenient")]
    pub permanent: bool,
}

/// Regex-based redirect.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct RedirectRegex {
    pub regex: String,
    pub replacement: String,
    #[serde(deserialize_with = "flex::lenient")]
    pub permanent: bool,
}

/// Replace the request path wholesale.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReplacePath {
    pub path: String,
}

/// Regex-based path rewrite.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReplacePathRegex {
    pub regex: String,
    pub replacement: String,
}

/// Buffer and bound request/response bodies.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Buffering {
    /// Largest accepted request body in bytes; `-1` means unlimited.
    #[serde(alias = "maxrequestbodybytes", deserialize_with = "flex::lenient")]
    pub max_request_body_bytes: i64,
    /// Largest accepted response body in bytes; `-1` means unlimited.
    #[serde(alias = "maxresponsebodybytes", deserialize_with = "flex::lenient")]
    pub max_response_body_bytes: i64,
}

impl Default for Buffering {
    fn default() -> Self {
        Self {
            max_request_body_bytes: -1,
            max_response_body_bytes: -1,
        }
    }
}

/// Cap concurrent in-flight requests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct InFlightReq {
    #[serde(deserialize_with = "flex::lenient")]
    pub amount: u64,
}

impl Default for InFlightReq {
    fn default() -> Self {
        Self { amount: 10 }
    }
}

/// Forward the client TLS certificate to the upstream.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PassTlsClientCert {
    #[serde(deserialize_with = "flex::lenient")]
    pub pem: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn router_defaults() {
        let r: Router = serde_json::from_str(r#"{"rule": "Host(`a`)", "service": "s"}"#).unwrap();
        assert_eq!(r.priority, 0);
        assert!(r.entry_points.is_empty());
        assert!(r.observability.access_logs);
    }

    #[test]
    fn service_variant_tags() {
        let s: Service =
            serde_json::from_str(r#"{"loadBalancer": {"servers": [{"url": "http://u1"}]}}"#)
                .unwrap();
        let Service::LoadBalancer(lb) = s else {
            panic!("expected load balancer")
        };
        assert_eq!(lb.servers[0].url, "http://u1");
        assert_eq!(lb.strategy, "wrr");
        assert!(lb.pass_host_header);
    }

    #[test]
    fn service_variant_lowercase_alias() {
        let s: Service =
            serde_json::from_str(r#"{"loadbalancer": {"servers": [{"url": "http://u1"}]}}"#)
                .unwrap();
        assert!(matches!(s, Service::LoadBalancer(_)));
    }

    #[test]
    fn middleware_variant_round_trip() {
        let m = Middleware::StripPrefix(StripPrefix {
            prefixes: vec!["/api".to_owned()],
        });
        let json = serde_json::to_string(&m).unwrap();
        assert!(json.contains("stripPrefix"));
        let back: Middleware = serde_json::from_str(&json).unwrap();
        assert_eq!(back, m);
    }

    #[test]
    fn mirroring_defaults_unlimited_body() {
        let m: Mirroring = serde_json::from_str(r#"{"service": "p"}"#).unwrap();
        assert_eq!(m.max_body_size, -1);
    }

    #[test]
    fn lenient_priority_from_string() {
        let r: Router =
            serde_json::from_str(r#"{"rule": "Path(`/`)", "service": "s", "priority": "42"}"#)
                .unwrap();
        assert_eq!(r.priority, 42);
    }
}
