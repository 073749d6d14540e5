//! Compiled HTTP matchers.
//!
//! [`compile_http`] specialises a parsed [`RuleExpr`] for per-request
//! evaluation; arguments are validated and pre-compiled (regexes, CIDR
//! ranges) once per build, never per request. The module also extracts the
//! static `Host`/`PathPrefix` literals a router *requires*, which the
//! dispatch index uses as a pure accelerator.

use std::net::IpAddr;

use ipnet::IpNet;
use regex::Regex;

use crate::ast::{Matcher, RuleExpr};
use crate::error::RuleError;

/// The per-request view a matcher evaluates against.
#[derive(Debug, Clone, Copy)]
pub struct RequestMeta<'a> {
    /// Request host, without port.
    pub host: &'a str,
    /// Request path.
    pub path: &'a str,
    /// Request method.
    pub method: &'a http::Method,
    /// Request headers.
    pub headers: &'a http::HeaderMap,
    /// Raw query string (without the leading `?`), if any.
    pub query: Option<&'a str>,
    /// Peer address of the client connection.
    pub client_ip: Option<IpAddr>,
}

/// A compiled HTTP matcher tree.
#[derive(Debug)]
pub enum HttpMatcher {
    And(Vec<HttpMatcher>),
    Or(Vec<HttpMatcher>),
    Not(Box<HttpMatcher>),
    /// Exact (case-insensitive) or `*.suffix` wildcard host match.
    Host(Vec<String>),
    HostRegexp(Vec<Regex>),
    Path(Vec<String>),
    PathPrefix(Vec<String>),
    PathRegexp(Vec<Regex>),
    Method(Vec<String>),
    Header(String, String),
    HeaderRegexp(String, Regex),
    /// Key with optional exact value; key-only checks presence.
    Query(String, Option<String>),
    ClientIp(Vec<IpNet>),
}

/// Compile a parsed rule into an HTTP matcher.
pub fn compile_http(expr: &RuleExpr) -> Result<HttpMatcher, RuleError> {
    match expr {
        RuleExpr::And(children) => Ok(HttpMatcher::And(
            children.iter().map(compile_http).collect::<Result<_, _>>()?,
        )),
        RuleExpr::Or(children) => Ok(HttpMatcher::Or(
            children.iter().map(compile_http).collect::<Result<_, _>>()?,
        )),
        RuleExpr::Not(child) => Ok(HttpMatcher::Not(Box::new(compile_http(child)?))),
        RuleExpr::Matcher(m) => compile_atom(m),
    }
}

fn compile_atom(m: &Matcher) -> Result<HttpMatcher, RuleError> {
    match m.name.as_str() {
        "Host" => {
            require_args(m, 1)?;
            Ok(HttpMatcher::Host(
                m.args.iter().map(|a| a.to_lowercase()).collect(),
            ))
        }
        "HostRegexp" => {
            require_args(m, 1)?;
            Ok(HttpMatcher::HostRegexp(compile_regexes("HostRegexp", &m.args)?))
        }
        "Path" => {
            require_args(m, 1)?;
            Ok(HttpMatcher::Path(m.args.clone()))
        }
        "PathPrefix" => {
            require_args(m, 1)?;
            Ok(HttpMatcher::PathPrefix(m.args.clone()))
        }
        "PathRegexp" => {
            require_args(m, 1)?;
            Ok(HttpMatcher::PathRegexp(compile_regexes("PathRegexp", &m.args)?))
        }
        "Method" => {
            require_args(m, 1)?;
            Ok(HttpMatcher::Method(
                m.args.iter().map(|a| a.to_uppercase()).collect(),
            ))
        }
        "Header" => {
            if m.args.len() != 2 {
                return Err(RuleError::BadArity(m.name.clone(), "2", m.args.len()));
            }
            Ok(HttpMatcher::Header(m.args[0].clone(), m.args[1].clone()))
        }
        "HeaderRegexp" => {
            if m.args.len() != 2 {
                return Err(RuleError::BadArity(m.name.clone(), "2", m.args.len()));
            }
            let re = Regex::new(&m.args[1]).map_err(|e| RuleError::BadArgument {
                matcher: "HeaderRegexp",
                arg: m.args[1].clone(),
                message: e.to_string(),
            })?;
            Ok(HttpMatcher::HeaderRegexp(m.args[0].clone(), re))
        }
        "Query" => {
            if m.args.is_empty() || m.args.len() > 2 {
                return Err(RuleError::BadArity(m.name.clone(), "1 or 2", m.args.len()));
            }
            Ok(HttpMatcher::Query(m.args[0].clone(), m.args.get(1).cloned()))
        }
        "ClientIP" => {
            require_args(m, 1)?;
            Ok(HttpMatcher::ClientIp(compile_cidrs("ClientIP", &m.args)?))
        }
        _ => Err(RuleError::UnknownMatcher(m.name.clone())),
    }
}

fn require_args(m: &Matcher, min: usize) -> Result<(), RuleError> {
    if m.args.len() < min {
        return Err(RuleError::BadArity(m.name.clone(), "at least 1", m.args.len()));
    }
    Ok(())
}

fn compile_regexes(matcher: &'static str, args: &[String]) -> Result<Vec<Regex>, RuleError> {
    args.iter()
        .map(|a| {
            Regex::new(a).map_err(|e| RuleError::BadArgument {
                matcher,
                arg: a.clone(),
                message: e.to_string(),
            })
        })
        .collect()
}

/// Parse CIDR ranges, accepting bare addresses as host prefixes.
///
/// Shared by the `ClientIP` matchers and IP-based middlewares.
pub fn compile_cidrs(matcher: &'static str, args: &[String]) -> Result<Vec<IpNet>, RuleError> {
    args.iter()
        .map(|a| {
            a.parse::<IpNet>()
                .or_else(|_| a.parse::<IpAddr>().map(IpNet::from))
                .map_err(|e| RuleError::BadArgument {
                    matcher,
                    arg: a.clone(),
                    message: e.to_string(),
                })
        })
        .collect()
}

/// `*.suffix` wildcard or exact host comparison (both sides lowercase).
fn host_matches(pattern: &str, host: &str) -> bool {
    if let Some(suffix) = pattern.strip_prefix("*.") {
        host.strip_suffix(suffix)
            .is_some_and(|head| head.ends_with('.') && head.len() > 1)
    } else {
        pattern == host
    }
}

impl HttpMatcher {
    /// Evaluate the matcher against one request. Short-circuits.
    pub fn matches(&self, req: &RequestMeta<'_>) -> bool {
        match self {
            Self::And(children) => children.iter().all(|c| c.matches(req)),
            Self::Or(children) => children.iter().any(|c| c.matches(req)),
            Self::Not(child) => !child.matches(req),
            Self::Host(hosts) => {
                let host = req.host.to_lowercase();
                hosts.iter().any(|h| host_matches(h, &host))
            }
            Self::HostRegexp(patterns) => patterns.iter().any(|p| p.is_match(req.host)),
            Self::Path(paths) => paths.iter().any(|p| p == req.path),
            Self::PathPrefix(prefixes) => prefixes.iter().any(|p| path_has_prefix(req.path, p)),
            Self::PathRegexp(patterns) => patterns.iter().any(|p| p.is_match(req.path)),
            Self::Method(methods) => methods.iter().any(|m| m == req.method.as_str()),
            Self::Header(key, value) => req
                .headers
                .get(key)
                .and_then(|v| v.to_str().ok())
                .is_some_and(|v| v == value),
            Self::HeaderRegexp(key, pattern) => req
                .headers
                .get(key)
                .and_then(|v| v.to_str().ok())
                .is_some_and(|v| pattern.is_match(v)),
            Self::Query(key, expected) => query_matches(req.query, key, expected.as_deref()),
            Self::ClientIp(nets) => req
                .client_ip
                .is_some_and(|ip| nets.iter().any(|net| net.contains(&ip))),
        }
    }
}

/// Segment-aware prefix test: `/foo` is a prefix of `/foo` and `/foo/bar`
/// but not of `/foobar`.
fn path_has_prefix(path: &str, prefix: &str) -> bool {
    let prefix = prefix.trim_end_matches('/');
    if prefix.is_empty() {
        return true;
    }
    match path.strip_prefix(prefix) {
        Some("") => true,
        Some(rest) => rest.starts_with('/'),
        None => false,
    }
}

fn query_matches(query: Option<&str>, key: &str, expected: Option<&str>) -> bool {
    let Some(query) = query else { return false };
    query.split('&').any(|pair| {
        let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
        k == key && expected.is_none_or(|e| e == v)
    })
}

/// The exact/wildcard host literals the rule requires, or `None` when the
/// rule cannot be factored by host (e.g. a disjunct without a Host atom,
/// or a negated/regex host).
pub fn static_hosts(expr: &RuleExpr) -> Option<Vec<String>> {
    match expr {
        RuleExpr::Matcher(m) if m.name == "Host" => {
            Some(m.args.iter().map(|a| a.to_lowercase()).collect())
        }
        RuleExpr::Matcher(_) | RuleExpr::Not(_) => None,
        // Any conjunct with a host requirement constrains the whole rule.
        RuleExpr::And(children) => children.iter().find_map(static_hosts),
        // Every disjunct must be constrained for the union to be one.
        RuleExpr::Or(children) => {
            let mut hosts = Vec::new();
            for child in children {
                hosts.extend(static_hosts(child)?);
            }
            Some(hosts)
        }
    }
}

/// The `PathPrefix` literals the rule requires, with the same
/// conservative factoring as [`static_hosts`].
pub fn static_path_prefixes(expr: &RuleExpr) -> Option<Vec<String>> {
    match expr {
        RuleExpr::Matcher(m) if m.name == "PathPrefix" => Some(m.args.clone()),
        RuleExpr::Matcher(_) | RuleExpr::Not(_) => None,
        RuleExpr::And(children) => children.iter().find_map(static_path_prefixes),
        RuleExpr::Or(children) => {
            let mut prefixes = Vec::new();
            for child in children {
                prefixes.extend(static_path_prefixes(child)?);
            }
            Some(prefixes)
        }
    }
}
