//! Pre-build validation of the qualified configuration tree.
//!
//! Validation removes invalid entities and records one issue per removal;
//! it never aborts the pass. Reference resolution is left to the build
//! step, which records its own per-entity errors.

use std::collections::{BTreeMap, BTreeSet};

use crate::config::{DynamicConfig, Middleware, Service};
use crate::error::{ConfigIssue, IssueScope};

/// Validate `config` in place, dropping invalid entities.
///
/// Checks performed here: reference cycles among Chain middlewares and
/// among Weighted/Mirroring services, negative or out-of-range numeric
/// fields, structurally empty entities (router without a rule or service,
/// load balancer without servers).
pub fn validate(config: &mut DynamicConfig) -> Vec<ConfigIssue> {
    let mut issues = Vec::new();

    check_http_routers(config, &mut issues);
    check_http_services(config, &mut issues);
    check_http_middlewares(config, &mut issues);
    check_service_cycles(config, &mut issues);
    check_chain_cycles(config, &mut issues);
    check_tcp(config, &mut issues);
    check_udp(config, &mut issues);

    issues
}

fn check_http_routers(config: &mut DynamicConfig, issues: &mut Vec<ConfigIssue>) {
    let mut bad = Vec::new();
    for (name, router) in &config.http.routers {
        if router.rule.trim().is_empty() {
            bad.push((name.clone(), "router has no rule".to_owned()));
        } else if router.service.trim().is_empty() {
            bad.push((name.clone(), "router has no service".to_owned()));
        }
    }
    for (name, message) in bad {
        config.http.routers.remove(&name);
        issues.push(ConfigIssue::new(IssueScope::HttpRouter, name, message));
    }
}

fn check_http_services(config: &mut DynamicConfig, issues: &mut Vec<ConfigIssue>) {
    let mut bad = Vec::new();
    for (name, service) in &config.http.services {
        let problem = match service {
            Service::LoadBalancer(lb) => {
                if lb.servers.is_empty() {
                    Some("load balancer has no servers".to_owned())
                } else if let Some(s) = lb.servers.iter().find(|s| s.weight < 0) {
                    Some(format!("negative server weight {}", s.weight))
                } else if let Some(hc) = &lb.health_check {
                    if hc.interval == 0 {
                        Some("health check interval must be positive".to_owned())
                    } else if hc.timeout == 0 {
                        Some("health check timeout must be positive".to_owned())
                    } else if hc.port == Some(0) {
                        Some("health check port must be positive".to_owned())
                    } else if hc
                        .status
                        .is_some_and(|s| !(100..=599).contains(&s))
                    {
                        Some(format!(
                            "health check status {} out of range",
                            hc.status.unwrap_or_default()
                        ))
                    } else {
                        None
                    }
                } else {
                    None
                }
            }
            Service::Weighted(w) => {
                if w.services.is_empty() {
                    Some("weighted service has no children".to_owned())
                } else {
                    w.services
                        .iter()
                        .find(|c| c.weight < 0)
                        .map(|c| format!("negative weight {} for child {:?}", c.weight, c.name))
                }
            }
            Service::Mirroring(m) => {
                if m.service.trim().is_empty() {
                    Some("mirroring service has no primary".to_owned())
                } else {
                    m.mirrors
                        .iter()
                        .find(|mi| !(0..=100).contains(&mi.percent))
                        .map(|mi| format!("mirror percent {} out of range", mi.percent))
                }
            }
        };
        if let Some(message) = problem {
            bad.push((name.clone(), message));
        }
    }
    for (name, message) in bad {
        config.http.services.remove(&name);
        issues.push(ConfigIssue::new(IssueScope::HttpService, name, message));
    }
}

fn check_http_middlewares(config: &mut DynamicConfig, issues: &mut Vec<ConfigIssue>) {
    let mut bad = Vec::new();
    for (name, middleware) in &config.http.middlewares {
        let problem = match middleware {
            Middleware::RateLimit(rl) if rl.period == 0 => {
                Some("rate limit period must be positive".to_owned())
            }
            Middleware::Retry(r) if r.attempts == 0 => {
                Some("retry attempts must be positive".to_owned())
            }
            Middleware::AddPrefix(ap) if ap.prefix.is_empty() => {
                Some("addPrefix needs a prefix".to_owned())
            }
            _ => None,
        };
        if let Some(message) = problem {
            bad.push((name.clone(), message));
        }
    }
    for (name, message) in bad {
        config.http.middlewares.remove(&name);
        issues.push(ConfigIssue::new(IssueScope::HttpMiddleware, name, message));
    }
}

/// Drop every member of every reference cycle among Weighted/Mirroring
/// services.
fn check_service_cycles(config: &mut DynamicConfig, issues: &mut Vec<ConfigIssue>) {
    let edges: BTreeMap<String, Vec<String>> = config
        .http
        .services
        .iter()
        .map(|(name, service)| {
            let refs = match service {
                Service::LoadBalancer(_) => Vec::new(),
                Service::Weighted(w) => w.services.iter().map(|c| c.name.clone()).collect(),
                Service::Mirroring(m) => {
                    let mut refs = vec![m.service.clone()];
                    refs.extend(m.mirrors.iter().map(|mi| mi.name.clone()));
                    refs
                }
            };
            (name.clone(), refs)
        })
        .collect();

    for name in cycle_members(&edges) {
        config.http.services.remove(&name);
        issues.push(ConfigIssue::new(
            IssueScope::HttpService,
            name,
            "service is part of a reference cycle",
        ));
    }
}

/// Drop every member of every Chain middleware cycle.
fn check_chain_cycles(config: &mut DynamicConfig, issues: &mut Vec<ConfigIssue>) {
    let edges: BTreeMap<String, Vec<String>> = config
        .http
        .middlewares
        .iter()
        .map(|(name, middleware)| {
            let refs = match middleware {
                Middleware::Chain(c) => c.middlewares.clone(),
                _ => Vec::new(),
            };
            (name.clone(), refs)
        })
        .collect();

    for name in cycle_members(&edges) {
        config.http.middlewares.remove(&name);
        issues.push(ConfigIssue::new(
            IssueScope::HttpMiddleware,
            name,
            "middleware is part of a chain cycle",
        ));
    }
}

fn check_tcp(config: &mut DynamicConfig, issues: &mut Vec<ConfigIssue>) {
    let mut bad = Vec::new();
    for (name, router) in &config.tcp.routers {
        if router.rule.trim().is_empty() {
            bad.push((name.clone(), "router has no rule".to_owned()));
        } else if router.service.trim().is_empty() {
            bad.push((name.clone(), "router has no service".to_owned()));
        }
    }
    for (name, message) in bad {
        config.tcp.routers.remove(&name);
        issues.push(ConfigIssue::new(IssueScope::TcpRouter, name, message));
    }

    let mut bad = Vec::new();
    for (name, crate::config::TcpService::LoadBalancer(lb)) in &config.tcp.services {
        if lb.servers.is_empty() {
            bad.push((name.clone(), "load balancer has no servers".to_owned()));
        }
    }
    for (name, message) in bad {
        config.tcp.services.remove(&name);
        issues.push(ConfigIssue::new(IssueScope::TcpService, name, message));
    }
}

fn check_udp(config: &mut DynamicConfig, issues: &mut Vec<ConfigIssue>) {
    let mut bad = Vec::new();
    for (name, router) in &config.udp.routers {
        if router.service.trim().is_empty() {
            bad.push((name.clone(), "router has no service".to_owned()));
        }
    }
    for (name, message) in bad {
        config.udp.routers.remove(&name);
        issues.push(ConfigIssue::new(IssueScope::UdpRouter, name, message));
    }

    let mut bad = Vec::new();
    for (name, crate::config::UdpService::LoadBalancer(lb)) in &config.udp.services {
        if lb.servers.is_empty() {
            bad.push((name.clone(), "load balancer has no servers".to_owned()));
        }
    }
    for (name, message) in bad {
        config.udp.services.remove(&name);
        issues.push(ConfigIssue::new(IssueScope::UdpService, name, message));
    }
}

#[derive(Clone, Copy, PartialEq)]
enum Color {
    White,
    Gray,
    Black,
}

/// All nodes participating in at least one reference cycle.
///
/// Three-color DFS; edges pointing outside the node set are ignored
/// (dangling references are the build step's concern).
fn cycle_members(edges: &BTreeMap<String, Vec<String>>) -> BTreeSet<String> {
    let mut colors: BTreeMap<&str, Color> =
        edges.keys().map(|k| (k.as_str(), Color::White)).collect();
    let mut members = BTreeSet::new();

    fn visit<'a>(
        node: &'a str,
        edges: &'a BTreeMap<String, Vec<String>>,
        colors: &mut BTreeMap<&'a str, Color>,
        path: &mut Vec<&'a str>,
        members: &mut BTreeSet<String>,
    ) {
        colors.insert(node, Color::Gray);
        path.push(node);
        if let Some(refs) = edges.get(node) {
            for next in refs {
                match colors.get(next.as_str()) {
                    Some(Color::White) => {
                        visit(next.as_str(), edges, colors, path, members);
                    }
                    Some(Color::Gray) => {
                        // Everything from the first occurrence of `next` on
                        // the current path is on the cycle.
                        if let Some(pos) = path.iter().position(|n| *n == next.as_str()) {
                            for member in &path[pos..] {
                                members.insert((*member).to_owned());
                            }
                        }
                    }
                    _ => {}
                }
            }
        }
        path.pop();
        colors.insert(node, Color::Black);
    }

    let keys: Vec<&str> = edges.keys().map(String::as_str).collect();
    for key in keys {
        if colors.get(key) == Some(&Color::White) {
            let mut path = Vec::new();
            visit(key, edges, &mut colors, &mut path, &mut members);
        }
    }
    members
}
