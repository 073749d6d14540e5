//! TCP configuration: SNI-routed raw connections.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use super::flex;

/// The TCP section of a configuration tree.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TcpConfig {
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub routers: BTreeMap<String, TcpRouter>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub services: BTreeMap<String, TcpService>,
}

/// A TCP router: `HostSNI` / `ClientIP` / `ALPN` rule over raw connections.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TcpRouter {
    #[serde(alias = "entrypoints", skip_serializing_if = "Vec::is_empty")]
    pub entry_points: Vec<String>,
    /// Matcher rule, e.g. ``HostSNI(`db.test`)``. The catch-all is
    /// ``HostSNI(`*`)`` with the lowest priority.
    pub rule: String,
    /// Explicit priority; `0` means "derive from rule length".
    #[serde(deserialize_with = "flex::lenient")]
    pub priority: i32,
    /// The TCP service receiving matched connections.
    pub service: String,
    /// TLS handling; `None` means plain TCP forwarding.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tls: Option<TcpTls>,
}

impl Default for TcpRouter {
    fn default() -> Self {
        Self {
            entry_points: Vec::new(),
            rule: String::new(),
            priority: 0,
            service: String::new(),
            tls: None,
        }
    }
}

/// TLS handling for a TCP router.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TcpTls {
    /// Forward the raw TLS stream without terminating; the peeked
    /// ClientHello bytes are replayed to the backend.
    #[serde(deserialize_with = "flex::lenient")]
    pub passthrough: bool,
}

/// A TCP service, one flavor per entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TcpService {
    #[serde(alias = "loadbalancer")]
    LoadBalancer(TcpLoadBalancer),
}

/// Round-robin over upstream addresses.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TcpLoadBalancer {
    pub servers: Vec<TcpServer>,
}

/// One upstream address (`host:port`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TcpServer {
    pub address: String,
}
