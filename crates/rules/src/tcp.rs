//! Compiled TCP connection matchers.
//!
//! TCP rules are evaluated once per accepted connection, after a bounded
//! ClientHello peek. `HostSNI` atoms other than the ``HostSNI(`*`)``
//! catch-all require a peeked SNI, so non-TLS connections skip SNI-only
//! rules.

use std::net::IpAddr;

use ipnet::IpNet;
use regex::Regex;

use crate::ast::{Matcher, RuleExpr};
use crate::error::RuleError;
use crate::http::compile_cidrs;

/// The per-connection view a TCP matcher evaluates against.
#[derive(Debug, Clone, Copy)]
pub struct ConnMeta<'a> {
    /// Server name from the peeked ClientHello, if the connection is TLS.
    pub sni: Option<&'a str>,
    /// Peer address.
    pub client_ip: Option<IpAddr>,
    /// ALPN protocols offered in the ClientHello.
    pub alpn: &'a [String],
}

/// A compiled TCP matcher tree.
#[derive(Debug)]
pub enum TcpMatcher {
    And(Vec<TcpMatcher>),
    Or(Vec<TcpMatcher>),
    Not(Box<TcpMatcher>),
    /// Exact SNI names; the single `*` argument matches any connection.
    HostSni(Vec<String>),
    HostSniRegexp(Vec<Regex>),
    ClientIp(Vec<IpNet>),
    Alpn(Vec<String>),
}

/// Compile a parsed rule into a TCP matcher.
pub fn compile_tcp(expr: &RuleExpr) -> Result<TcpMatcher, RuleError> {
    match expr {
        RuleExpr::And(children) => Ok(TcpMatcher::And(
            children.iter().map(compile_tcp).collect::<Result<_, _>>()?,
        )),
        RuleExpr::Or(children) => Ok(TcpMatcher::Or(
            children.iter().map(compile_tcp).collect::<Result<_, _>>()?,
        )),
        RuleExpr::Not(child) => Ok(TcpMatcher::Not(Box::new(compile_tcp(child)?))),
        RuleExpr::Matcher(m) => compile_atom(m),
    }
}

fn compile_atom(m: &Matcher) -> Result<TcpMatcher, RuleError> {
    if m.args.is_empty() {
        return Err(RuleError::BadArity(m.name.clone(), "at least 1", 0));
    }
    match m.name.as_str() {
        "HostSNI" => Ok(TcpMatcher::HostSni(
            m.args.iter().map(|a| a.to_lowercase()).collect(),
        )),
        "HostSNIRegexp" => {
            let patterns = m
                .args
                .iter()
                .map(|a| {
                    Regex::new(a).map_err(|e| RuleError::BadArgument {
                        matcher: "HostSNIRegexp",
                        arg: a.clone(),
                        message: e.to_string(),
                    })
                })
                .collect::<Result<_, _>>()?;
            Ok(TcpMatcher::HostSniRegexp(patterns))
        }
        "ClientIP" => Ok(TcpMatcher::ClientIp(compile_cidrs("ClientIP", &m.args)?)),
        "ALPN" => Ok(TcpMatcher::Alpn(m.args.clone())),
        _ => Err(RuleError::UnknownMatcher(m.name.clone())),
    }
}

/// Whether the rule is exactly the ``HostSNI(`*`)`` catch-all, which sorts
/// below every other TCP router regardless of declared priority.
pub fn is_catch_all(expr: &RuleExpr) -> bool {
    matches!(
        expr,
        RuleExpr::Matcher(Matcher { name, args })
            if name == "HostSNI" && args.len() == 1 && args[0] == "*"
    )
}

impl TcpMatcher {
    /// Evaluate the matcher against one connection. Short-circuits.
    pub fn matches(&self, conn: &ConnMeta<'_>) -> bool {
        match self {
            Self::And(children) => children.iter().all(|c| c.matches(conn)),
            Self::Or(children) => children.iter().any(|c| c.matches(conn)),
            Self::Not(child) => !child.matches(conn),
            Self::HostSni(names) => {
                if names.iter().any(|n| n == "*") {
                    return true;
                }
                let Some(sni) = conn.sni else { return false };
                let sni = sni.to_lowercase();
                names.iter().any(|n| *n == sni)
            }
            Self::HostSniRegexp(patterns) => conn
                .sni
                .is_some_and(|sni| patterns.iter().any(|p| p.is_match(sni))),
            Self::ClientIp(nets) => conn
                .client_ip
                .is_some_and(|ip| nets.iter().any(|net| net.contains(&ip))),
            Self::Alpn(protos) => protos.iter().any(|p| conn.alpn.contains(p)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::parser::parse;

    fn compile(rule: &str) -> TcpMatcher {
        compile_tcp(&parse(rule).unwrap()).unwrap()
    }

    fn tls(sni: &str) -> ConnMeta<'_> {
        ConnMeta {
            sni: Some(sni),
            client_ip: None,
            alpn: &[],
        }
    }

    const PLAIN: ConnMeta<'static> = ConnMeta {
        sni: None,
        client_ip: None,
        alpn: &[],
    };

    #[test]
    fn catch_all_matches_plain_and_tls() {
        let m = compile("HostSNI(`*`)");
        assert!(m.matches(&PLAIN));
        assert!(m.matches(&tls("db.test")));
    }

    #[test]
    fn specific_sni_skips_plain_connections() {
        let m = compile("HostSNI(`db.test`)");
        assert!(!m.matches(&PLAIN));
        assert!(m.matches(&tls("db.test")));
        assert!(m.matches(&tls("DB.Test")));
        assert!(!m.matches(&tls("other.test")));
    }

    #[test]
    fn client_ip_works_without_tls() {
        let m = compile("ClientIP(`10.0.0.0/8`)");
        let conn = ConnMeta {
            sni: None,
            client_ip: Some("10.1.2.3".parse().unwrap()),
            alpn: &[],
        };
        assert!(m.matches(&conn));
    }

    #[test]
    fn alpn_matches_offered_protocols() {
        let m = compile("ALPN(`h2`)");
        let offered = vec!["http/1.1".to_owned(), "h2".to_owned()];
        let conn = ConnMeta {
            sni: Some("a.test"),
            client_ip: None,
            alpn: &offered,
        };
        assert!(m.matches(&conn));
        assert!(!m.matches(&PLAIN));
    }

    #[test]
    fn catch_all_detection() {
        assert!(is_catch_all(&parse("HostSNI(`*`)").unwrap()));
        assert!(!is_catch_all(&parse("HostSNI(`db.test`)").unwrap()));
        assert!(!is_catch_all(
            &parse("HostSNI(`*`) && ClientIP(`10.0.0.0/8`)").unwrap()
        ));
    }

    #[test]
    fn http_matchers_rejected_for_tcp() {
        let expr = parse("PathPrefix(`/x`)").unwrap();
        assert!(matches!(
            compile_tcp(&expr),
            Err(RuleError::UnknownMatcher(_))
        ));
    }
}
