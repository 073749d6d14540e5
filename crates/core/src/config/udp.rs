//! UDP configuration: entry-point routed datagram sessions.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// The UDP section of a configuration tree.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UdpConfig {
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub routers: BTreeMap<String, UdpRouter>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    pub services: BTreeMap<String, UdpService>,
}

/// A UDP router. Routing is by entry point only; there is no rule language.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UdpRouter {
    #[serde(alias = "entrypoints", skip_serializing_if = "Vec::is_empty")]
    pub entry_points: Vec<String>,
    /// The UDP service receiving datagrams from the entry point.
    pub service: String,
}

/// A UDP service, one flavor per entity.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum UdpService {
    #[serde(alias = "loadbalancer")]
    LoadBalancer(UdpLoadBalancer),
}

/// Round-robin over upstream datagram addresses.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UdpLoadBalancer {
    pub servers: Vec<UdpServer>,
}

/// One upstream address (`host:port`).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UdpServer {
    pub address: String,
}
