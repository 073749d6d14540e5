//! The typed dynamic configuration tree.
//!
//! Four top-level maps keyed by entity name (bare in provider payloads,
//! `local@provider` after qualification). All types are plain values with
//! deep equality; the aggregator and the watcher loop rely on `PartialEq`
//! to skip no-op rebuilds.

pub mod http;
pub mod tcp;
pub mod udp;

pub(crate) mod flex;

use serde::{Deserialize, Serialize};

pub use http::{
    AddPrefix, BasicAuth, Buffering, Chain, CircuitBreaker, Compress, Domain, ForwardAuth,
    HeadersConfig, HealthCheck, HttpConfig, InFlightReq, IpAllowList, LoadBalancer, Middleware,
    Mirror, Mirroring, Observability, PassTlsClientCert, RateLimit, RedirectRegex, RedirectScheme,
    ReplacePath, ReplacePathRegex, Retry, Router, RouterTls, Server, Service, Sticky,
    StickyCookie, StripPrefix, Weighted, WeightedItem,
};
pub use tcp::{TcpConfig, TcpLoadBalancer, TcpRouter, TcpServer, TcpService, TcpTls};
pub use udp::{UdpConfig, UdpLoadBalancer, UdpRouter, UdpServer, UdpService};

/// A provider's (or the merged) configuration tree.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct DynamicConfig {
    /// HTTP routers, services and middlewares.
    pub http: HttpConfig,
    /// TCP routers and services.
    pub tcp: TcpConfig,
    /// UDP routers and services.
    pub udp: UdpConfig,
}

impl DynamicConfig {
    /// Whether the tree carries no entities at all.
    pub fn is_empty(&self) -> bool {
        self.http.routers.is_empty()
            && self.http.services.is_empty()
            && self.http.middlewares.is_empty()
            && self.tcp.routers.is_empty()
            && self.tcp.services.is_empty()
            && self.udp.routers.is_empty()
            && self.udp.services.is_empty()
    }
}
