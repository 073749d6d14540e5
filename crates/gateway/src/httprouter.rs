//! Per-entry-point HTTP router tables.
//!
//! Routers are held in one priority-ordered list; an index over static
//! `Host` and `PathPrefix` literals narrows the candidate set before
//! evaluation. Candidates are always evaluated in global priority order,
//! so the index is a pure accelerator: it selects exactly the router the
//! linear scan would.

use std::collections::{BTreeSet, HashMap};

use fluxgate_rules::{HttpMatcher, RequestMeta, RuleExpr};
use fluxgate_rules::http::{static_hosts, static_path_prefixes};

use crate::handler::SharedHandler;

/// One compiled router in an entry point's table.
pub struct RouterEntry {
    /// Qualified router name.
    pub name: String,
    /// Qualified service name (for the request context).
    pub service: String,
    /// Effective priority (explicit, else rule length).
    pub priority: i64,
    /// Rule length, the first tie breaker.
    pub rule_len: usize,
    /// Compiled matcher.
    pub matcher: HttpMatcher,
    /// Fully composed handler (middlewares around the service).
    pub handler: SharedHandler,
}

enum IndexSlot {
    /// Exact host literals the router requires.
    Hosts(Vec<String>),
    /// `*.suffix` wildcard host patterns the router requires.
    WildcardHosts(Vec<String>),
    /// Path prefixes the router requires.
    Prefixes(Vec<String>),
    /// Not factorable; always a candidate.
    Linear,
}

/// The compiled router table for one entry point.
pub struct EntryPointRouter {
    /// Entries sorted by descending priority, then rule length, then name.
    entries: Vec<RouterEntry>,
    by_host: HashMap<String, Vec<usize>>,
    wildcard_hosts: Vec<(String, usize)>,
    by_prefix: HashMap<String, Vec<usize>>,
    linear: Vec<usize>,
}

impl EntryPointRouter {
    /// Build the table from compiled entries and their parsed rules.
    ///
    /// `entries[i]` must correspond to `rules[i]`.
    pub fn new(mut indexed: Vec<(RouterEntry, RuleExpr)>) -> Self {
        // Strict order: priority desc, rule length desc, name asc.
        indexed.sort_by(|(a, _), (b, _)| {
            b.priority
                .cmp(&a.priority)
                .then(b.rule_len.cmp(&a.rule_len))
                .then(a.name.cmp(&b.name))
        });

        let mut entries = Vec::with_capacity(indexed.len());
        let mut by_host: HashMap<String, Vec<usize>> = HashMap::new();
        let mut wildcard_hosts = Vec::new();
        let mut by_prefix: HashMap<String, Vec<usize>> = HashMap::new();
        let mut linear = Vec::new();

        for (i, (entry, rule)) in indexed.into_iter().enumerate() {
            match classify(&rule) {
                IndexSlot::Hosts(hosts) => {
                    for host in hosts {
                        by_host.entry(host).or_default().push(i);
                    }
                }
                IndexSlot::WildcardHosts(patterns) => {
                    for pattern in patterns {
                        wildcard_hosts.push((pattern, i));
                    }
                }
                IndexSlot::Prefixes(prefixes) => {
                    for prefix in prefixes {
                        let key = prefix.trim_end_matches('/').to_owned();
                        by_prefix.entry(key).or_default().push(i);
                    }
                }
                IndexSlot::Linear => linear.push(i),
            }
            entries.push(entry);
        }

        Self {
            entries,
            by_host,
            wildcard_hosts,
            by_prefix,
            linear,
        }
    }

    /// Select the first matching router for a request, in priority order.
    pub fn select(&self, meta: &RequestMeta<'_>) -> Option<&RouterEntry> {
        // Candidate indices, deduplicated and ordered. Entries are stored
        // in priority order, so index order is priority order.
        let mut candidates: BTreeSet<usize> = self.linear.iter().copied().collect();

        let host = meta.host.to_lowercase();
        if let Some(indices) = self.by_host.get(&host) {
            candidates.extend(indices.iter().copied());
        }
        for (pattern, index) in &self.wildcard_hosts {
            if wildcard_matches(pattern, &host) {
                candidates.insert(*index);
            }
        }
        for prefix in path_prefixes(meta.path) {
            if let Some(indices) = self.by_prefix.get(prefix) {
                candidates.extend(indices.iter().copied());
            }
        }

        candidates
            .into_iter()
            .map(|i| &self.entries[i])
            .find(|entry| entry.matcher.matches(meta))
    }

    /// Evaluate every router linearly, ignoring the index. Test oracle for
    /// the accelerator equivalence invariant.
    pub fn select_linear(&self, meta: &RequestMeta<'_>) -> Option<&RouterEntry> {
        self.entries.iter().find(|entry| entry.matcher.matches(meta))
    }

    /// All entries in priority order.
    pub fn entries(&self) -> &[RouterEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

fn classify(rule: &RuleExpr) -> IndexSlot {
    if let Some(hosts) = static_hosts(rule) {
        let (wildcards, exact): (Vec<_>, Vec<_>) =
            hosts.into_iter().partition(|h| h.contains('*'));
        if exact.is_empty() && !wildcards.is_empty() {
            return IndexSlot::WildcardHosts(wildcards);
        }
        if wildcards.is_empty() {
            return IndexSlot::Hosts(exact);
        }
        // Mixed exact and wildcard requirements do not factor cleanly.
        return IndexSlot::Linear;
    }
    if let Some(prefixes) = static_path_prefixes(rule) {
        return IndexSlot::Prefixes(prefixes);
    }
    IndexSlot::Linear
}

fn wildcard_matches(pattern: &str, host: &str) -> bool {
    pattern.strip_prefix("*.").is_some_and(|suffix| {
        host.strip_suffix(suffix)
            .is_some_and(|head| head.ends_with('.') && head.len() > 1)
    })
}

/// The path itself and every segment-truncated prefix, `/a/b` ->
/// [`/a/b`, `/a`, ``]; the empty string keys `PathPrefix(`/`)` entries.
fn path_prefixes(path: &str) -> impl Iterator<Item = &str> {
    let trimmed = path.trim_end_matches('/');
    std::iter::successors(Some(trimmed), |current| {
        current.rfind('/').map(|pos| &current[..pos])
    })
}
