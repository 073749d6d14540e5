//! The compiled, immutable artifact of one build.
//!
//! A runtime owns everything the data plane needs: per-entry-point router
//! tables, service handlers with their connection pools, and the
//! background tasks (health checks, mirror clones) tied to its lifetime.
//! Draining is two-phase: background work stops when the runtime is
//! superseded, in-flight requests get `drain_grace` to finish, then the
//! hard token fires and the last `Arc` drop releases the pools.

use std::collections::{BTreeMap, HashMap};
use std::net::IpAddr;
use std::sync::Arc;

use http::StatusCode;
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::debug;

use fluxgate_core::{ConfigIssue, DynamicConfig, IssueScope};
use fluxgate_rules::RequestMeta;

use crate::handler::{Request, RequestContext, Response, status_response};
use crate::httprouter::EntryPointRouter;
use crate::metrics::GatewayMetrics;
use crate::tcprouter::TcpEntryPointRouter;
use crate::udprouter::UdpUpstreams;

/// Health of one configured entity, surfaced via `/api/rawdata`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityState {
    Enabled,
    Disabled,
    Error,
}

/// Status record for one entity.
#[derive(Debug, Clone, Serialize)]
pub struct EntityStatus {
    pub scope: IssueScope,
    pub status: EntityState,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub errors: Vec<String>,
}

/// Everything the admin API needs to describe the live configuration.
#[derive(Debug, Clone, Serialize)]
pub struct RuntimeStatus {
    /// Snapshot revision this runtime was built from.
    pub revision: u64,
    /// The merged, qualified configuration, including entities that were
    /// dropped with errors.
    pub config: DynamicConfig,
    /// Per-entity state keyed by qualified name.
    pub entities: BTreeMap<String, EntityStatus>,
}

impl RuntimeStatus {
    /// Assemble the status map: every entity starts enabled, recorded
    /// issues flip it to error.
    pub fn assemble(revision: u64, config: DynamicConfig, issues: &[ConfigIssue]) -> Self {
        let mut entities = BTreeMap::new();
        for name in config.http.routers.keys() {
            entities.insert(
                name.clone(),
                EntityStatus {
                    scope: IssueScope::HttpRouter,
                    status: EntityState::Enabled,
                    errors: Vec::new(),
                },
            );
        }
        for name in config.http.middlewares.keys() {
            entities.insert(
                name.clone(),
                EntityStatus {
                    scope: IssueScope::HttpMiddleware,
                    status: EntityState::Enabled,
                    errors: Vec::new(),
                },
            );
        }
        for name in config.http.services.keys() {
            entities.insert(
                name.clone(),
                EntityStatus {
                    scope: IssueScope::HttpService,
                    status: EntityState::Enabled,
                    errors: Vec::new(),
                },
            );
        }
        for name in config.tcp.routers.keys() {
            entities.insert(
                name.clone(),
                EntityStatus {
                    scope: IssueScope::TcpRouter,
                    status: EntityState::Enabled,
                    errors: Vec::new(),
                },
            );
        }
        for name in config.tcp.services.keys() {
            entities.insert(
                name.clone(),
                EntityStatus {
                    scope: IssueScope::TcpService,
                    status: EntityState::Enabled,
                    errors: Vec::new(),
                },
            );
        }
        for name in config.udp.routers.keys() {
            entities.insert(
                name.clone(),
                EntityStatus {
                    scope: IssueScope::UdpRouter,
                    status: EntityState::Enabled,
                    errors: Vec::new(),
                },
            );
        }
        for name in config.udp.services.keys() {
            entities.insert(
                name.clone(),
                EntityStatus {
                    scope: IssueScope::UdpService,
                    status: EntityState::Enabled,
                    errors: Vec::new(),
                },
            );
        }

        for issue in issues {
            let entry = entities
                .entry(issue.name.clone())
                .or_insert_with(|| EntityStatus {
                    scope: issue.scope,
                    status: EntityState::Enabled,
                    errors: Vec::new(),
                });
            entry.status = EntityState::Error;
            entry.errors.push(issue.message.clone());
        }

        Self {
            revision,
            config,
            entities,
        }
    }
}

/// The compiled runtime. Shared read-only; only the switcher replaces it.
pub struct Runtime {
    pub revision: u64,
    http: HashMap<String, Arc<EntryPointRouter>>,
    tcp: HashMap<String, Arc<TcpEntryPointRouter>>,
    udp: HashMap<String, Arc<UdpUpstreams>>,
    status: Arc<RuntimeStatus>,
    background: CancellationToken,
    hard: CancellationToken,
    tracker: TaskTracker,
    metrics: Arc<GatewayMetrics>,
}

impl Runtime {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        revision: u64,
        http: HashMap<String, Arc<EntryPointRouter>>,
        tcp: HashMap<String, Arc<TcpEntryPointRouter>>,
        udp: HashMap<String, Arc<UdpUpstreams>>,
        status: RuntimeStatus,
        background: CancellationToken,
        hard: CancellationToken,
        tracker: TaskTracker,
        metrics: Arc<GatewayMetrics>,
    ) -> Self {
        Self {
            revision,
            http,
            tcp,
            udp,
            status: Arc::new(status),
            background,
            hard,
            tracker,
            metrics,
        }
    }

    /// The status view served by the admin API.
    pub fn status(&self) -> Arc<RuntimeStatus> {
        Arc::clone(&self.status)
    }

    /// The TCP router table for an entry point.
    pub fn tcp_router(&self, entry_point: &str) -> Option<&Arc<TcpEntryPointRouter>> {
        self.tcp.get(entry_point)
    }

    /// The UDP upstream set for an entry point.
    pub fn udp_upstreams(&self, entry_point: &str) -> Option<&Arc<UdpUpstreams>> {
        self.udp.get(entry_point)
    }

    /// The HTTP router table for an entry point.
    pub fn http_router(&self, entry_point: &str) -> Option<&Arc<EntryPointRouter>> {
        self.http.get(entry_point)
    }

    /// Background task tracker; builder-spawned loops live here.
    pub(crate) fn tracker(&self) -> &TaskTracker {
        &self.tracker
    }

    /// Dispatch one HTTP request arriving on `entry_point`.
    ///
    /// The caller holds this runtime's `Arc` for the whole request, so a
    /// request never observes a mix of two runtimes.
    pub async fn dispatch_http(
        &self,
        entry_point: &str,
        req: Request,
        client_ip: Option<IpAddr>,
    ) -> Response {
        self.metrics.increment_http_requests();

        let Some(router) = self.http.get(entry_point) else {
            self.metrics.increment_http_not_found();
            return status_response(StatusCode::NOT_FOUND);
        };

        let host = request_host(&req);
        let meta = RequestMeta {
            host: &host,
            path: req.uri().path(),
            method: req.method(),
            headers: req.headers(),
            query: req.uri().query(),
            client_ip,
        };

        let Some(entry) = router.select(&meta) else {
            self.metrics.increment_http_not_found();
            debug!(entry_point, host = %host, path = %req.uri().path(), "no router matched");
            return status_response(StatusCode::NOT_FOUND);
        };

        let mut req = req;
        req.extensions_mut().insert(RequestContext {
            router: entry.name.clone(),
            service: entry.service.clone(),
            entry_point: entry_point.to_owned(),
            client_ip,
        });
        entry.handler.handle(req).await
    }

    /// First drain phase, run at install time: background loops stop.
    pub(crate) fn begin_drain(&self) {
        self.background.cancel();
    }

    /// Second drain phase, run after the grace period: requests still on
    /// this runtime have their upstream calls cut.
    pub(crate) fn finish_drain(&self) {
        self.hard.cancel();
        self.tracker.close();
    }

    /// Wait for the runtime's background tasks to finish.
    pub(crate) async fn wait_background(&self) {
        self.tracker.wait().await;
    }
}

/// Request host: `Host` header (without port) or the URI authority.
fn request_host(req: &Request) -> String {
    req.headers()
        .get(http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .or_else(|| req.uri().authority().map(http::uri::Authority::as_str))
        .map(strip_port)
        .unwrap_or_default()
}

fn strip_port(host: &str) -> String {
    // IPv6 literals keep their brackets; only a trailing `:port` is cut.
    if let Some(end) = host.rfind(']') {
        return host[..=end].to_owned();
    }
    host.split(':').next().unwrap_or(host).to_owned()
}
