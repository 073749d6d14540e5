//! Flat key-value decoding of dynamic configuration.
//!
//! KV stores and label-based providers deliver configuration as flat
//! `root/http/routers/<name>/rule = ...` pairs. Both `.` and `/` are
//! accepted as separators, structural keys are case-insensitive, and
//! numeric segments index sequences. The decoder assembles a JSON tree and
//! hands it to the typed model, whose serde aliases accept the lowercase
//! spellings; leaf scalars stay strings and are coerced by the model's
//! lenient deserializers.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::config::DynamicConfig;
use crate::error::KvError;

/// Map-valued fields whose child keys are user data, not structural keys.
/// Their case (and everything beneath `plugin`) is preserved verbatim.
const NAME_MAP_FIELDS: &[&str] = &["customrequestheaders", "customresponseheaders", "plugin"];

#[derive(Debug)]
enum Node {
    Map(BTreeMap<String, Node>),
    Seq(BTreeMap<usize, Node>),
    Leaf(String),
}

impl Node {
    fn into_value(self) -> Value {
        match self {
            Self::Leaf(s) => Value::String(s),
            Self::Map(m) => Value::Object(
                m.into_iter()
                    .map(|(k, v)| (k, v.into_value()))
                    .collect(),
            ),
            // Sparse indices collapse in order.
            Self::Seq(s) => Value::Array(s.into_values().map(Node::into_value).collect()),
        }
    }
}

/// Insert `value` at `path` below `node`, overwriting on shape conflicts
/// (last write wins, matching KV store semantics).
fn insert(node: &mut Node, path: &[String], value: &str) {
    let Some((head, rest)) = path.split_first() else {
        *node = Node::Leaf(value.to_owned());
        return;
    };

    if let Ok(idx) = head.parse::<usize>() {
        if !matches!(node, Node::Seq(_)) {
            *node = Node::Seq(BTreeMap::new());
        }
        if let Node::Seq(seq) = node {
            let child = seq.entry(idx).or_insert_with(|| Node::Map(BTreeMap::new()));
            insert(child, rest, value);
        }
    } else {
        if !matches!(node, Node::Map(_)) {
            *node = Node::Map(BTreeMap::new());
        }
        if let Node::Map(map) = node {
            let child = map
                .entry(head.clone())
                .or_insert_with(|| Node::Map(BTreeMap::new()));
            insert(child, rest, value);
        }
    }
}

/// Split a key on `/` and `.`, dropping empty segments.
fn segments(key: &str) -> Vec<&str> {
    key.split(['/', '.']).filter(|s| !s.is_empty()).collect()
}

/// Normalize the tail of a key (everything after the entity name):
/// structural segments are lowercased; children of name-valued maps keep
/// their case, and the whole subtree under `plugin` is preserved.
fn normalize_tail(tail: &[&str]) -> Vec<String> {
    let mut out = Vec::with_capacity(tail.len());
    let mut preserve_depth: Option<usize> = None;
    for (i, seg) in tail.iter().enumerate() {
        let lowered = seg.to_lowercase();
        match preserve_depth {
            // Under `plugin` everything is user data.
            Some(d) if tail.get(d).map(|s| s.to_lowercase()).as_deref() == Some("plugin") => {
                out.push((*seg).to_owned());
            }
            // Directly under a header map: the header name keeps its case.
            Some(d) if i == d + 1 => {
                out.push((*seg).to_owned());
                preserve_depth = None;
            }
            _ => {
                if NAME_MAP_FIELDS.contains(&lowered.as_str()) {
                    preserve_depth = Some(i);
                }
                out.push(lowered);
            }
        }
    }
    out
}

/// Decode flat `(key, value)` pairs rooted at `root` into a configuration
/// tree. Unknown sections and truncated keys are errors; unknown fields
/// inside an entity are ignored by the typed model.
pub fn decode<K, V>(pairs: &[(K, V)], root: &str) -> Result<DynamicConfig, KvError>
where
    K: AsRef<str>,
    V: AsRef<str>,
{
    let root_lower = root.to_lowercase();
    let mut tree = Node::Map(BTreeMap::new());

    for (key, value) in pairs {
        let key = key.as_ref();
        let segs = segments(key);

        let Some((first, rest)) = segs.split_first() else {
            return Err(KvError::ShortKey(key.to_owned()));
        };
        if first.to_lowercase() != root_lower {
            return Err(KvError::BadRoot(key.to_owned(), root.to_owned()));
        }
        // root/section/kind/name/field...
        if rest.len() < 4 {
            return Err(KvError::ShortKey(key.to_owned()));
        }

        let section = rest[0].to_lowercase();
        if !matches!(section.as_str(), "http" | "tcp" | "udp") {
            return Err(KvError::UnknownSection {
                key: key.to_owned(),
                section,
            });
        }
        let kind = rest[1].to_lowercase();
        if !matches!(kind.as_str(), "routers" | "services" | "middlewares") {
            return Err(KvError::UnknownSection {
                key: key.to_owned(),
                section: kind,
            });
        }

        let name = rest[2].to_owned();
        let mut path = vec![section, kind, name];
        path.extend(normalize_tail(&rest[3..]));
        insert(&mut tree, &path, value.as_ref());
    }

    Ok(serde_json::from_value(tree.into_value())?)
}

/// Encode a configuration tree into flat `(key, value)` pairs rooted at
/// `root`. `decode(encode(c)) == c` for every tree expressible in path
/// form (the canonical struct keys survive the decoder's lowercasing via
/// serde aliases).
pub fn encode(config: &DynamicConfig, root: &str) -> Vec<(String, String)> {
    let value = serde_json::to_value(config).unwrap_or(Value::Null);
    let mut pairs = Vec::new();
    walk(&value, &mut vec![root.to_owned()], &mut pairs);
    pairs
}

fn walk(value: &Value, path: &mut Vec<String>, out: &mut Vec<(String, String)>) {
    match value {
        Value::Object(map) => {
            for (k, v) in map {
                path.push(k.clone());
                walk(v, path, out);
                path.pop();
            }
        }
        Value::Array(items) => {
            for (i, v) in items.iter().enumerate() {
                path.push(i.to_string());
                walk(v, path, out);
                path.pop();
            }
        }
        Value::Null => {}
        Value::String(s) => out.push((path.join("/"), s.clone())),
        other => out.push((path.join("/"), other.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Middleware, Service};

    #[test]
    fn router_with_ordered_middlewares() {
        let pairs = [
            ("fluxgate/http/routers/R0/rule", "Host(`x.y`)"),
            ("fluxgate/http/routers/R0/middlewares/0", "m1"),
            ("fluxgate/http/routers/R0/middlewares/1", "m2"),
            ("fluxgate/http/routers/R0/service", "s"),
        ];
        let config = decode(&pairs, "fluxgate").unwrap();
        let router = &config.http.routers["R0"];
        assert_eq!(router.rule, "Host(`x.y`)");
        assert_eq!(router.middlewares, vec!["m1", "m2"]);
        assert_eq!(router.service, "s");
    }

    #[test]
    fn dot_separator_and_mixed_case() {
        let pairs = [
            ("FLUXGATE.Http.Routers.web.Rule", "PathPrefix(`/`)"),
            ("fluxgate.http.routers.web.service", "app"),
            ("fluxgate.http.routers.web.EntryPoints.0", "web"),
        ];
        let config = decode(&pairs, "fluxgate").unwrap();
        let router = &config.http.routers["web"];
        assert_eq!(router.rule, "PathPrefix(`/`)");
        assert_eq!(router.entry_points, vec!["web"]);
    }

    #[test]
    fn service_and_middleware_entities() {
        let pairs = [
            (
                "fluxgate/http/services/app/loadbalancer/servers/0/url",
                "http://u1",
            ),
            (
                "fluxgate/http/services/app/loadbalancer/servers/1/url",
                "http://u2",
            ),
            (
                "fluxgate/http/services/app/loadbalancer/passhostheader",
                "false",
            ),
            ("fluxgate/http/middlewares/sp/stripprefix/prefixes/0", "/api"),
        ];
        let config = decode(&pairs, "fluxgate").unwrap();
        let Service::LoadBalancer(lb) = &config.http.services["app"] else {
            panic!("expected load balancer")
        };
        assert_eq!(lb.servers.len(), 2);
        assert!(!lb.pass_host_header);
        let Middleware::StripPrefix(sp) = &config.http.middlewares["sp"] else {
            panic!("expected strip prefix")
        };
        assert_eq!(sp.prefixes, vec!["/api"]);
    }

    #[test]
    fn header_names_keep_case() {
        let pairs = [(
            "fluxgate/http/middlewares/h/headers/customrequestheaders/X-Forwarded-Proto",
            "https",
        )];
        let config = decode(&pairs, "fluxgate").unwrap();
        let Middleware::Headers(h) = &config.http.middlewares["h"] else {
            panic!("expected headers")
        };
        assert_eq!(h.custom_request_headers["X-Forwarded-Proto"], "https");
    }

    #[test]
    fn tls_domains_with_sans() {
        let pairs = [
            ("fluxgate/http/routers/r/rule", "Host(`a.test`)"),
            ("fluxgate/http/routers/r/service", "s"),
            ("fluxgate/http/routers/r/tls/domains/0/main", "a.test"),
            ("fluxgate/http/routers/r/tls/domains/0/sans/0", "b.a.test"),
            ("fluxgate/http/routers/r/tls/domains/0/sans/1", "c.a.test"),
        ];
        let config = decode(&pairs, "fluxgate").unwrap();
        let tls = config.http.routers["r"].tls.as_ref().unwrap();
        assert_eq!(tls.domains[0].main, "a.test");
        assert_eq!(tls.domains[0].sans, vec!["b.a.test", "c.a.test"]);
    }

    #[test]
    fn tcp_and_udp_sections() {
        let pairs = [
            ("fluxgate/tcp/routers/db/rule", "HostSNI(`*`)"),
            ("fluxgate/tcp/routers/db/service", "pg"),
            (
                "fluxgate/tcp/services/pg/loadbalancer/servers/0/address",
                "10.0.0.2:5432",
            ),
            ("fluxgate/udp/routers/dns/entrypoints/0", "dns"),
            ("fluxgate/udp/routers/dns/service", "resolver"),
            (
                "fluxgate/udp/services/resolver/loadbalancer/servers/0/address",
                "10.0.0.3:53",
            ),
        ];
        let config = decode(&pairs, "fluxgate").unwrap();
        assert_eq!(config.tcp.routers["db"].service, "pg");
        assert_eq!(config.udp.routers["dns"].entry_points, vec!["dns"]);
    }

    #[test]
    fn wrong_root_rejected() {
        let err = decode(&[("other/http/routers/r/rule", "x")], "fluxgate").unwrap_err();
        assert!(matches!(err, KvError::BadRoot(..)));
    }

    #[test]
    fn short_key_rejected() {
        let err = decode(&[("fluxgate/http/routers", "x")], "fluxgate").unwrap_err();
        assert!(matches!(err, KvError::ShortKey(_)));
    }

    #[test]
    fn unknown_section_rejected() {
        let err = decode(&[("fluxgate/grpc/routers/r/rule", "x")], "fluxgate").unwrap_err();
        assert!(matches!(err, KvError::UnknownSection { .. }));
    }

    #[test]
    fn encode_decode_round_trip() {
        let pairs = [
            ("fluxgate/http/routers/web/rule", "Host(`a.test`)"),
            ("fluxgate/http/routers/web/priority", "12"),
            ("fluxgate/http/routers/web/service", "app"),
            ("fluxgate/http/routers/web/middlewares/0", "sp"),
            (
                "fluxgate/http/services/app/loadbalancer/servers/0/url",
                "http://u1",
            ),
            ("fluxgate/http/middlewares/sp/stripprefix/prefixes/0", "/api"),
        ];
        let config = decode(&pairs, "fluxgate").unwrap();
        let encoded = encode(&config, "fluxgate");
        let back = decode(&encoded, "fluxgate").unwrap();
        assert_eq!(back, config);
    }
}
