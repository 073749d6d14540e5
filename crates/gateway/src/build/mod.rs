//! The build step: validated snapshot in, compiled [`Runtime`] out.
//!
//! Builds are pure with respect to process state: everything a handler
//! needs is captured from the configuration at build time. Any single
//! entity failure (bad rule, dangling reference, panic in a constructor)
//! drops that entity with a recorded issue and the build continues.

use std::collections::{BTreeMap, HashMap};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use fluxgate_core::config::{Service, TcpService, UdpService};
use fluxgate_core::{ConfigIssue, DynamicConfig, IssueScope, validate};
use fluxgate_rules::{RuleExpr, compile_http, compile_tcp, is_catch_all, parse};

use crate::error::BuildError;
use crate::handler::{MiddlewareLayer, SharedHandler};
use crate::health::spawn_health_checks;
use crate::httprouter::{EntryPointRouter, RouterEntry};
use crate::metrics::GatewayMetrics;
use crate::middleware::{MiddlewareFactory, compose};
use crate::proxy::Upstream;
use crate::runtime::{Runtime, RuntimeStatus};
use crate::service::{
    LoadBalancerHandler, MirrorTarget, MirroringHandler, WeightedChild, WeightedHandler,
};
use crate::tcprouter::{TcpEntryPointRouter, TcpRouterEntry, TcpUpstreams};
use crate::udprouter::UdpUpstreams;

/// Static inputs the builder needs beyond the snapshot: the process's
/// entry points and the internal entities user configuration can never
/// shadow.
#[derive(Clone, Default)]
pub struct BuildContext {
    pub http_entry_points: Vec<String>,
    pub tcp_entry_points: Vec<String>,
    pub udp_entry_points: Vec<String>,
    /// Process-owned routers (`api@internal` among them), appended to
    /// every build.
    pub internal_routers: Vec<InternalRouter>,
}

/// One process-owned router injected into every runtime.
#[derive(Clone)]
pub struct InternalRouter {
    /// Qualified name, by convention `<thing>@internal`.
    pub name: String,
    pub rule: String,
    pub priority: i64,
    /// Entry points to attach to; empty means every HTTP entry point.
    pub entry_points: Vec<String>,
    pub handler: SharedHandler,
}

/// Compile a merged snapshot into a runtime.
///
/// `merged` is the qualified tree; validation runs here so the status map
/// can show dropped entities alongside the survivors.
pub fn build(
    merged: DynamicConfig,
    revision: u64,
    cx: &BuildContext,
    metrics: &Arc<GatewayMetrics>,
) -> Runtime {
    // The status view keeps the pre-validation tree so errored entities
    // stay visible through the API.
    let display = merged.clone();
    let mut config = merged;
    let mut issues = validate(&mut config);

    let tracker = TaskTracker::new();
    let background = CancellationToken::new();
    let hard = CancellationToken::new();

    let http = build_http(
        &config,
        cx,
        &tracker,
        &background,
        &hard,
        &mut issues,
    );
    let tcp = build_tcp(&config, cx, &mut issues);
    let udp = build_udp(&config, cx, &mut issues);

    metrics.increment_builds();
    metrics.add_build_entity_errors(issues.len() as u64);
    if issues.is_empty() {
        info!(revision, "runtime built");
    } else {
        warn!(revision, errors = issues.len(), "runtime built with entity errors");
    }

    let status = RuntimeStatus::assemble(revision, display, &issues);
    Runtime::new(
        revision, http, tcp, udp, status, background, hard, tracker, metrics.clone(),
    )
}

/// Convert a panic payload into a build error, keeping the loop alive.
fn guarded<T>(f: impl FnOnce() -> Result<T, BuildError>) -> Result<T, BuildError> {
    match std::panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => {
            let message = payload
                .downcast_ref::<&str>()
                .map(|s| (*s).to_owned())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "opaque panic".to_owned());
            Err(BuildError::Panic(message))
        }
    }
}

// ---------------------------------------------------------------------------
// HTTP
// ---------------------------------------------------------------------------

/// Memoizing service factory; recursion handles Weighted/Mirroring
/// children (cycles were removed by validation).
struct ServiceFactory<'a> {
    definitions: &'a BTreeMap<String, Service>,
    built: BTreeMap<String, SharedHandler>,
    tracker: &'a TaskTracker,
    background: &'a CancellationToken,
    hard: &'a CancellationToken,
}

impl ServiceFactory<'_> {
    fn resolve(&mut self, name: &str) -> Result<SharedHandler, BuildError> {
        if let Some(handler) = self.built.get(name) {
            return Ok(Arc::clone(handler));
        }
        let definition = self
            .definitions
            .get(name)
            .ok_or_else(|| BuildError::ServiceNotFound(name.to_owned()))?;
        let handler = match definition {
            Service::LoadBalancer(lb) => self.build_load_balancer(name, lb)?,
            Service::Weighted(w) => {
                let mut children = Vec::with_capacity(w.services.len());
                for child in &w.services {
                    children.push(WeightedChild {
                        name: child.name.clone(),
                        weight: child.weight,
                        handler: self.resolve(&child.name)?,
                    });
                }
                let sticky = w.sticky.as_ref().and_then(|s| s.cookie.clone());
                Arc::new(WeightedHandler::new(children, sticky)) as SharedHandler
            }
            Service::Mirroring(m) => {
                let primary = self.resolve(&m.service)?;
                let mut mirrors = Vec::with_capacity(m.mirrors.len());
                for mirror in &m.mirrors {
                    mirrors.push(MirrorTarget {
                        name: mirror.name.clone(),
                        percent: mirror.percent,
                        handler: self.resolve(&mirror.name)?,
                    });
                }
                Arc::new(MirroringHandler::new(
                    primary,
                    mirrors,
                    m.max_body_size,
                    self.tracker.clone(),
                )) as SharedHandler
            }
        };
        self.built.insert(name.to_owned(), Arc::clone(&handler));
        Ok(handler)
    }

    fn build_load_balancer(
        &self,
        name: &str,
        lb: &fluxgate_core::config::LoadBalancer,
    ) -> Result<SharedHandler, BuildError> {
        if !lb.strategy.eq_ignore_ascii_case("wrr") {
            return Err(BuildError::UnsupportedStrategy(lb.strategy.clone()));
        }
        let upstreams = lb
            .servers
            .iter()
            .map(|server| Upstream::parse(&server.url, server.weight).map(Arc::new))
            .collect::<Result<Vec<_>, _>>()?;

        if let Some(health) = &lb.health_check {
            spawn_health_checks(
                name.to_owned(),
                upstreams.clone(),
                health,
                self.tracker,
                self.background.clone(),
            );
        }

        let sticky = lb.sticky.as_ref().and_then(|s| s.cookie.clone());
        Ok(Arc::new(LoadBalancerHandler::new(
            name.to_owned(),
            upstreams,
            sticky,
            lb.pass_host_header,
            self.hard.clone(),
        )))
    }
}

fn build_http(
    config: &DynamicConfig,
    cx: &BuildContext,
    tracker: &TaskTracker,
    background: &CancellationToken,
    hard: &CancellationToken,
    issues: &mut Vec<ConfigIssue>,
) -> HashMap<String, Arc<EntryPointRouter>> {
    let mut middleware_factory = MiddlewareFactory::new(&config.http.middlewares);
    let mut service_factory = ServiceFactory {
        definitions: &config.http.services,
        built: BTreeMap::new(),
        tracker,
        background,
        hard,
    };

    let mut tables: HashMap<String, Vec<(RouterEntry, RuleExpr)>> = HashMap::new();

    for (name, router) in &config.http.routers {
        let result = guarded(|| {
            let parsed = parse(&router.rule)?;

            let mut layers: Vec<MiddlewareLayer> = Vec::with_capacity(router.middlewares.len());
            for middleware in &router.middlewares {
                layers.push(middleware_factory.resolve(middleware)?);
            }
            let service = service_factory.resolve(&router.service)?;
            let handler = compose(&layers, service);

            let priority = effective_priority(router.priority, &router.rule);
            let entry_points = if router.entry_points.is_empty() {
                cx.http_entry_points.clone()
            } else {
                router.entry_points.clone()
            };

            let mut placed = Vec::new();
            for entry_point in entry_points {
                let matcher = compile_http(&parsed)?;
                placed.push((
                    entry_point,
                    RouterEntry {
                        name: name.clone(),
                        service: router.service.clone(),
                        priority,
                        rule_len: router.rule.len(),
                        matcher,
                        handler: Arc::clone(&handler),
                    },
                ));
            }
            Ok((placed, parsed))
        });

        match result {
            Ok((placed, parsed)) => {
                for (entry_point, entry) in placed {
                    tables
                        .entry(entry_point)
                        .or_default()
                        .push((entry, parsed.clone()));
                }
            }
            Err(e) => {
                issues.push(ConfigIssue::new(
                    IssueScope::HttpRouter,
                    name.clone(),
                    e.to_string(),
                ));
            }
        }
    }

    // Process-owned routers are always present and cannot be shadowed:
    // the `internal` provider id is reserved, so no user entity shares
    // their qualified names.
    for internal in &cx.internal_routers {
        let result = guarded(|| {
            let parsed = parse(&internal.rule)?;
            let entry_points = if internal.entry_points.is_empty() {
                cx.http_entry_points.clone()
            } else {
                internal.entry_points.clone()
            };
            let mut placed = Vec::new();
            for entry_point in entry_points {
                let matcher = compile_http(&parsed)?;
                placed.push((
                    entry_point,
                    RouterEntry {
                        name: internal.name.clone(),
                        service: internal.name.clone(),
                        priority: internal.priority,
                        rule_len: internal.rule.len(),
                        matcher,
                        handler: Arc::clone(&internal.handler),
                    },
                ));
            }
            Ok((placed, parsed))
        });
        match result {
            Ok((placed, parsed)) => {
                for (entry_point, entry) in placed {
                    tables
                        .entry(entry_point)
                        .or_default()
                        .push((entry, parsed.clone()));
                }
            }
            Err(e) => {
                warn!(router = %internal.name, error = %e, "internal router failed to build");
            }
        }
    }

    tables
        .into_iter()
        .map(|(entry_point, entries)| (entry_point, Arc::new(EntryPointRouter::new(entries))))
        .collect()
}

#[allow(clippy::cast_possible_wrap)]
fn effective_priority(declared: i32, rule: &str) -> i64 {
    if declared == 0 {
        rule.len() as i64
    } else {
        i64::from(declared)
    }
}

// ---------------------------------------------------------------------------
// TCP
// ---------------------------------------------------------------------------

fn build_tcp(
    config: &DynamicConfig,
    cx: &BuildContext,
    issues: &mut Vec<ConfigIssue>,
) -> HashMap<String, Arc<TcpEntryPointRouter>> {
    let mut services: BTreeMap<String, Arc<TcpUpstreams>> = BTreeMap::new();
    for (name, TcpService::LoadBalancer(lb)) in &config.tcp.services {
        let addresses = lb.servers.iter().map(|s| s.address.clone()).collect();
        services.insert(
            name.clone(),
            Arc::new(TcpUpstreams::new(name.clone(), addresses)),
        );
    }

    let mut tables: HashMap<String, Vec<TcpRouterEntry>> = HashMap::new();
    for (name, router) in &config.tcp.routers {
        let result = guarded(|| {
            let parsed = parse(&router.rule)?;
            let passthrough = match &router.tls {
                None => false,
                Some(tls) if tls.passthrough => true,
                // Termination needs a certificate resolver, which sits
                // behind an external interface.
                Some(_) => return Err(BuildError::TlsTermination),
            };
            let service = services
                .get(&router.service)
                .cloned()
                .ok_or_else(|| BuildError::ServiceNotFound(router.service.clone()))?;

            let entry_points = if router.entry_points.is_empty() {
                cx.tcp_entry_points.clone()
            } else {
                router.entry_points.clone()
            };
            let mut placed = Vec::new();
            for entry_point in entry_points {
                placed.push((
                    entry_point,
                    TcpRouterEntry {
                        name: name.clone(),
                        priority: effective_priority(router.priority, &router.rule),
                        rule_len: router.rule.len(),
                        catch_all: is_catch_all(&parsed),
                        matcher: compile_tcp(&parsed)?,
                        service: Arc::clone(&service),
                        passthrough,
                    },
                ));
            }
            Ok(placed)
        });
        match result {
            Ok(placed) => {
                for (entry_point, entry) in placed {
                    tables.entry(entry_point).or_default().push(entry);
                }
            }
            Err(e) => {
                issues.push(ConfigIssue::new(
                    IssueScope::TcpRouter,
                    name.clone(),
                    e.to_string(),
                ));
            }
        }
    }

    tables
        .into_iter()
        .map(|(entry_point, entries)| (entry_point, Arc::new(TcpEntryPointRouter::new(entries))))
        .collect()
}

// ---------------------------------------------------------------------------
// UDP
// ---------------------------------------------------------------------------

fn build_udp(
    config: &DynamicConfig,
    cx: &BuildContext,
    issues: &mut Vec<ConfigIssue>,
) -> HashMap<String, Arc<UdpUpstreams>> {
    let mut table: HashMap<String, Arc<UdpUpstreams>> = HashMap::new();

    for (name, router) in &config.udp.routers {
        let Some(UdpService::LoadBalancer(lb)) = config.udp.services.get(&router.service) else {
            issues.push(ConfigIssue::new(
                IssueScope::UdpRouter,
                name.clone(),
                BuildError::ServiceNotFound(router.service.clone()).to_string(),
            ));
            continue;
        };
        let addresses: Vec<String> = lb.servers.iter().map(|s| s.address.clone()).collect();

        let entry_points = if router.entry_points.is_empty() {
            cx.udp_entry_points.clone()
        } else {
            router.entry_points.clone()
        };
        for entry_point in entry_points {
            if let Some(existing) = table.get(&entry_point) {
                issues.push(ConfigIssue::new(
                    IssueScope::UdpRouter,
                    name.clone(),
                    format!(
                        "entry point {entry_point:?} already bound by {:?}",
                        existing.router
                    ),
                ));
                continue;
            }
            table.insert(
                entry_point,
                Arc::new(UdpUpstreams::new(
                    name.clone(),
                    router.service.clone(),
                    addresses.clone(),
                )),
            );
        }
    }

    table
}
