//! Snapshot flattening: provider-local names become `local@provider`.
//!
//! Cross-provider references must spell the `@provider` suffix explicitly;
//! bare references resolve to the emitting provider. The internal provider
//! is applied last so user configuration can never shadow internal
//! entities such as the API router.

use crate::config::{DynamicConfig, Middleware, Service};
use crate::message::{ProviderId, Snapshot};
use crate::name::qualify_name;

/// Flatten a snapshot into one tree with globally unique qualified names.
pub fn merge_snapshot(snapshot: &Snapshot) -> DynamicConfig {
    let mut merged = DynamicConfig::default();

    let (internal, user): (Vec<_>, Vec<_>) = snapshot
        .configs
        .iter()
        .partition(|(id, _)| id.is_internal());

    for (provider, config) in user.into_iter().chain(internal) {
        merge_provider(&mut merged, provider, config);
    }
    merged
}

fn merge_provider(merged: &mut DynamicConfig, provider: &ProviderId, config: &DynamicConfig) {
    let p = provider.as_str();

    for (name, router) in &config.http.routers {
        let mut router = router.clone();
        router.service = qualify_name(&router.service, p);
        for m in &mut router.middlewares {
            *m = qualify_name(m, p);
        }
        merged.http.routers.insert(qualify_name(name, p), router);
    }

    for (name, service) in &config.http.services {
        let mut service = service.clone();
        match &mut service {
            Service::LoadBalancer(_) => {}
            Service::Weighted(w) => {
                for child in &mut w.services {
                    child.name = qualify_name(&child.name, p);
                }
            }
            Service::Mirroring(m) => {
                m.service = qualify_name(&m.service, p);
                for mirror in &mut m.mirrors {
                    mirror.name = qualify_name(&mirror.name, p);
                }
            }
        }
        merged.http.services.insert(qualify_name(name, p), service);
    }

    for (name, middleware) in &config.http.middlewares {
        let mut middleware = middleware.clone();
        if let Middleware::Chain(chain) = &mut middleware {
            for m in &mut chain.middlewares {
                *m = qualify_name(m, p);
            }
        }
        merged
            .http
            .middlewares
            .insert(qualify_name(name, p), middleware);
    }

    for (name, router) in &config.tcp.routers {
        let mut router = router.clone();
        router.service = qualify_name(&router.service, p);
        merged.tcp.routers.insert(qualify_name(name, p), router);
    }
    for (name, service) in &config.tcp.services {
        merged
            .tcp
            .services
            .insert(qualify_name(name, p), service.clone());
    }

    for (name, router) in &config.udp.routers {
        let mut router = router.clone();
        router.service = qualify_name(&router.service, p);
        merged.udp.routers.insert(qualify_name(name, p), router);
    }
    for (name, service) in &config.udp.services {
        merged
            .udp
            .services
            .insert(qualify_name(name, p), service.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LoadBalancer, Router, Server, Weighted, WeightedItem};

    fn lb(urls: &[&str]) -> Service {
        Service::LoadBalancer(LoadBalancer {
            servers: urls
                .iter()
                .map(|u| Server {
                    url: (*u).to_owned(),
                    weight: 0,
                })
                .collect(),
            ..LoadBalancer::default()
        })
    }

    #[test]
    fn names_and_references_gain_qualifiers() {
        let mut config = DynamicConfig::default();
        config.http.routers.insert(
            "rt".to_owned(),
            Router {
                rule: "Host(`a.test`)".to_owned(),
                service: "svc".to_owned(),
                middlewares: vec!["sp".to_owned(), "auth@docker".to_owned()],
                ..Router::default()
            },
        );
        config.http.services.insert("svc".to_owned(), lb(&["http://u1"]));

        let mut snapshot = Snapshot::default();
        snapshot.configs.insert(ProviderId::new("file"), config);

        let merged = merge_snapshot(&snapshot);
        let router = &merged.http.routers["rt@file"];
        assert_eq!(router.service, "svc@file");
        assert_eq!(router.middlewares, vec!["sp@file", "auth@docker"]);
        assert!(merged.http.services.contains_key("svc@file"));
    }

    #[test]
    fn same_local_name_from_two_providers_does_not_collide() {
        let mut a = DynamicConfig::default();
        a.http.services.insert("svc".to_owned(), lb(&["http://a"]));
        let mut b = DynamicConfig::default();
        b.http.services.insert("svc".to_owned(), lb(&["http://b"]));

        let mut snapshot = Snapshot::default();
        snapshot.configs.insert(ProviderId::new("file"), a);
        snapshot.configs.insert(ProviderId::new("docker"), b);

        let merged = merge_snapshot(&snapshot);
        assert!(merged.http.services.contains_key("svc@file"));
        assert!(merged.http.services.contains_key("svc@docker"));
    }

    #[test]
    fn weighted_children_qualified() {
        let mut config = DynamicConfig::default();
        config.http.services.insert(
            "split".to_owned(),
            Service::Weighted(Weighted {
                services: vec![
                    WeightedItem {
                        name: "a".to_owned(),
                        weight: 3,
                    },
                    WeightedItem {
                        name: "b@kv".to_owned(),
                        weight: 1,
                    },
                ],
                sticky: None,
            }),
        );

        let mut snapshot = Snapshot::default();
        snapshot.configs.insert(ProviderId::new("file"), config);

        let merged = merge_snapshot(&snapshot);
        let Service::Weighted(w) = &merged.http.services["split@file"] else {
            panic!("expected weighted")
        };
        assert_eq!(w.services[0].name, "a@file");
        assert_eq!(w.services[1].name, "b@kv");
    }
}
