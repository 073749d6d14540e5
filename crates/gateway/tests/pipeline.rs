//! End-to-end pipeline tests: KV pairs decoded, flattened, built into a
//! runtime, and exercised with real upstream servers.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::State;
use axum::routing::any;
use http_body_util::BodyExt;
use tokio::net::TcpListener;

use fluxgate_core::{ProviderId, Snapshot, kv, merge_snapshot};
use fluxgate_gateway::build::{BuildContext, InternalRouter, build};
use fluxgate_gateway::handler::{
    HttpHandler, Request, Response, empty_body, full_body, status_response,
};
use fluxgate_gateway::metrics::GatewayMetrics;
use fluxgate_gateway::runtime::{EntityState, Runtime};
use fluxgate_gateway::switcher::Switcher;
use fluxgate_core::DynamicConfig;

/// Spawn a real HTTP upstream that answers `<marker> <path>` to any
/// request, with an optional artificial delay.
async fn spawn_upstream(marker: &'static str, delay: Duration) -> SocketAddr {
    async fn echo(
        State((marker, delay)): State<(&'static str, Duration)>,
        req: axum::extract::Request,
    ) -> String {
        tokio::time::sleep(delay).await;
        format!("{marker} {}", req.uri().path())
    }

    let app = axum::Router::new()
        .route("/", any(echo))
        .route("/{*rest}", any(echo))
        .with_state((marker, delay));
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    addr
}

fn runtime_from_pairs(pairs: &[(String, String)], cx: &BuildContext) -> Runtime {
    let config = kv::decode(pairs, "fluxgate").unwrap();
    let mut snapshot = Snapshot::default();
    snapshot.configs.insert(ProviderId::new("file"), config);
    snapshot.revision = 1;
    let merged = merge_snapshot(&snapshot);
    build(merged, snapshot.revision, cx, &Arc::new(GatewayMetrics::default()))
}

fn web_context() -> BuildContext {
    BuildContext {
        http_entry_points: vec!["web".to_owned()],
        ..BuildContext::default()
    }
}

fn get(host: &str, path: &str) -> Request {
    http::Request::builder()
        .method(http::Method::GET)
        .uri(format!("http://{host}{path}"))
        .header(http::header::HOST, host)
        .body(empty_body())
        .unwrap()
}

async fn body_text(response: Response) -> String {
    let bytes = response.into_body().collect().await.unwrap().to_bytes();
    String::from_utf8_lossy(&bytes).into_owned()
}

fn pair(key: &str, value: impl Into<String>) -> (String, String) {
    (key.to_owned(), value.into())
}

#[tokio::test]
async fn host_routing_with_strip_prefix_and_round_robin() {
    let u1 = spawn_upstream("u1", Duration::ZERO).await;
    let u2 = spawn_upstream("u2", Duration::ZERO).await;

    let pairs = vec![
        pair("fluxgate/http/routers/rt/rule", "Host(`a.test`)"),
        pair("fluxgate/http/routers/rt/entrypoints/0", "web"),
        pair("fluxgate/http/routers/rt/middlewares/0", "sp"),
        pair("fluxgate/http/routers/rt/service", "svc"),
        pair("fluxgate/http/middlewares/sp/stripprefix/prefixes/0", "/api"),
        pair(
            "fluxgate/http/services/svc/loadbalancer/servers/0/url",
            format!("http://{u1}"),
        ),
        pair(
            "fluxgate/http/services/svc/loadbalancer/servers/1/url",
            format!("http://{u2}"),
        ),
    ];
    let runtime = runtime_from_pairs(&pairs, &web_context());

    // The upstream sees the stripped path.
    let response = runtime.dispatch_http("web", get("a.test", "/api/x"), None).await;
    assert_eq!(response.status(), http::StatusCode::OK);
    let first = body_text(response).await;
    assert!(first.ends_with(" /x"), "unexpected body {first:?}");

    // Round-robin alternates between the two upstreams.
    let second = body_text(
        runtime
            .dispatch_http("web", get("a.test", "/api/x"), None)
            .await,
    )
    .await;
    let third = body_text(
        runtime
            .dispatch_http("web", get("a.test", "/api/x"), None)
            .await,
    )
    .await;
    assert_ne!(first.split(' ').next(), second.split(' ').next());
    assert_eq!(first.split(' ').next(), third.split(' ').next());

    // A host the rule does not cover is a 404 without body.
    let miss = runtime.dispatch_http("web", get("b.test", "/api/x"), None).await;
    assert_eq!(miss.status(), http::StatusCode::NOT_FOUND);
    assert!(body_text(miss).await.is_empty());
}

#[tokio::test]
async fn priority_beats_specificity() {
    let ua = spawn_upstream("svcA", Duration::ZERO).await;
    let ub = spawn_upstream("svcB", Duration::ZERO).await;

    let pairs = vec![
        pair("fluxgate/http/routers/a/rule", "PathPrefix(`/`)"),
        pair("fluxgate/http/routers/a/priority", "1"),
        pair("fluxgate/http/routers/a/service", "svcA"),
        pair("fluxgate/http/routers/b/rule", "PathPrefix(`/foo`)"),
        pair("fluxgate/http/routers/b/priority", "10"),
        pair("fluxgate/http/routers/b/service", "svcB"),
        pair(
            "fluxgate/http/services/svcA/loadbalancer/servers/0/url",
            format!("http://{ua}"),
        ),
        pair(
            "fluxgate/http/services/svcB/loadbalancer/servers/0/url",
            format!("http://{ub}"),
        ),
    ];
    let runtime = runtime_from_pairs(&pairs, &web_context());

    let foo = body_text(
        runtime
            .dispatch_http("web", get("x.test", "/foo/bar"), None)
            .await,
    )
    .await;
    assert!(foo.starts_with("svcB"));

    let bar = body_text(runtime.dispatch_http("web", get("x.test", "/bar"), None).await).await;
    assert!(bar.starts_with("svcA"));
}

#[tokio::test]
async fn unresolved_middleware_drops_router_and_records_error() {
    let u1 = spawn_upstream("u1", Duration::ZERO).await;

    let pairs = vec![
        pair("fluxgate/http/routers/rt/rule", "Host(`a.test`)"),
        pair("fluxgate/http/routers/rt/middlewares/0", "missing"),
        pair("fluxgate/http/routers/rt/service", "svc"),
        pair("fluxgate/http/routers/ok/rule", "Host(`ok.test`)"),
        pair("fluxgate/http/routers/ok/service", "svc"),
        pair(
            "fluxgate/http/services/svc/loadbalancer/servers/0/url",
            format!("http://{u1}"),
        ),
    ];
    let runtime = runtime_from_pairs(&pairs, &web_context());

    // The broken router is absent: traffic for it gets a 404.
    let miss = runtime.dispatch_http("web", get("a.test", "/"), None).await;
    assert_eq!(miss.status(), http::StatusCode::NOT_FOUND);

    // The valid router still serves.
    let ok = runtime.dispatch_http("web", get("ok.test", "/"), None).await;
    assert_eq!(ok.status(), http::StatusCode::OK);

    // The status map carries the exact reference error.
    let status = runtime.status();
    let entity = &status.entities["rt@file"];
    assert_eq!(entity.status, EntityState::Error);
    assert_eq!(entity.errors[0], r#"middleware "missing@file" not found"#);
}

#[tokio::test]
async fn all_unhealthy_upstreams_return_503_after_match() {
    // Point the service at a port nothing listens on; the health probe
    // marks it unhealthy on its first (immediate) tick.
    let dead = {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        listener.local_addr().unwrap()
        // Listener drops here, closing the port.
    };

    let pairs = vec![
        pair("fluxgate/http/routers/rt/rule", "Host(`a.test`)"),
        pair("fluxgate/http/routers/rt/service", "svc"),
        pair(
            "fluxgate/http/services/svc/loadbalancer/servers/0/url",
            format!("http://{dead}"),
        ),
        pair("fluxgate/http/services/svc/loadbalancer/healthcheck/path", "/health"),
        pair("fluxgate/http/services/svc/loadbalancer/healthcheck/interval", "1"),
        pair("fluxgate/http/services/svc/loadbalancer/healthcheck/timeout", "1"),
    ];
    let runtime = runtime_from_pairs(&pairs, &web_context());

    // Give the first probe a moment to fail.
    tokio::time::sleep(Duration::from_millis(500)).await;

    let response = runtime.dispatch_http("web", get("a.test", "/"), None).await;
    // The router matched (not 404); the service answered 503.
    assert_eq!(response.status(), http::StatusCode::SERVICE_UNAVAILABLE);
}

struct PingHandler;

#[async_trait::async_trait]
impl HttpHandler for PingHandler {
    async fn handle(&self, _req: Request) -> Response {
        let mut response = status_response(http::StatusCode::OK);
        *response.body_mut() = full_body("OK");
        response
    }
}

#[tokio::test]
async fn zero_providers_still_serve_internal_entities() {
    let cx = BuildContext {
        http_entry_points: vec!["web".to_owned()],
        internal_routers: vec![InternalRouter {
            name: "ping@internal".to_owned(),
            rule: "Path(`/ping`)".to_owned(),
            priority: i64::from(i32::MAX),
            entry_points: Vec::new(),
            handler: Arc::new(PingHandler),
        }],
        ..BuildContext::default()
    };

    let runtime = build(
        DynamicConfig::default(),
        0,
        &cx,
        &Arc::new(GatewayMetrics::default()),
    );

    let ping = runtime.dispatch_http("web", get("any.test", "/ping"), None).await;
    assert_eq!(ping.status(), http::StatusCode::OK);

    let miss = runtime.dispatch_http("web", get("any.test", "/other"), None).await;
    assert_eq!(miss.status(), http::StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn internal_router_wins_over_user_catch_all() {
    let u1 = spawn_upstream("user", Duration::ZERO).await;

    let pairs = vec![
        pair("fluxgate/http/routers/all/rule", "PathPrefix(`/`)"),
        pair("fluxgate/http/routers/all/priority", "1000000"),
        pair("fluxgate/http/routers/all/service", "svc"),
        pair(
            "fluxgate/http/services/svc/loadbalancer/servers/0/url",
            format!("http://{u1}"),
        ),
    ];
    let config = kv::decode(&pairs, "fluxgate").unwrap();
    let mut snapshot = Snapshot::default();
    snapshot.configs.insert(ProviderId::new("file"), config);
    let merged = merge_snapshot(&snapshot);

    let cx = BuildContext {
        http_entry_points: vec!["web".to_owned()],
        internal_routers: vec![InternalRouter {
            name: "ping@internal".to_owned(),
            rule: "Path(`/ping`)".to_owned(),
            priority: i64::MAX,
            entry_points: Vec::new(),
            handler: Arc::new(PingHandler),
        }],
        ..BuildContext::default()
    };
    let runtime = build(merged, 1, &cx, &Arc::new(GatewayMetrics::default()));

    // /ping goes to the internal handler despite the user catch-all.
    let ping = runtime.dispatch_http("web", get("any.test", "/ping"), None).await;
    assert_eq!(body_text(ping).await, "OK");

    // Everything else reaches the user service.
    let other = body_text(runtime.dispatch_http("web", get("any.test", "/x"), None).await).await;
    assert!(other.starts_with("user"));
}

#[tokio::test]
async fn zero_downtime_swap_drains_old_runtime() {
    let slow = spawn_upstream("slow", Duration::from_millis(300)).await;

    let pairs = vec![
        pair("fluxgate/http/routers/poll/rule", "Host(`slow.test`)"),
        pair("fluxgate/http/routers/poll/service", "svc"),
        pair(
            "fluxgate/http/services/svc/loadbalancer/servers/0/url",
            format!("http://{slow}"),
        ),
    ];
    let cx = web_context();
    let metrics = Arc::new(GatewayMetrics::default());

    let boot = build(DynamicConfig::default(), 0, &cx, &metrics);
    let switcher = Arc::new(Switcher::new(boot, Duration::from_millis(700), Arc::clone(&metrics)));

    let config = kv::decode(&pairs, "fluxgate").unwrap();
    let mut snapshot = Snapshot::default();
    snapshot.configs.insert(ProviderId::new("file"), config);
    let v1 = build(merge_snapshot(&snapshot), 1, &cx, &metrics);
    switcher.install(v1);

    // Start long requests pinned to v1, exactly as a listener would:
    // load the runtime once, use it for the whole request.
    let mut tasks = Vec::new();
    for _ in 0..16 {
        let runtime = switcher.current();
        tasks.push(tokio::spawn(async move {
            runtime
                .dispatch_http("web", get("slow.test", "/hold"), None)
                .await
                .status()
        }));
    }
    tokio::time::sleep(Duration::from_millis(50)).await;

    // v2 removes the router while those requests are in flight.
    let v2 = build(DynamicConfig::default(), 2, &cx, &metrics);
    switcher.install(v2);

    // Requests started after the install never reach v1.
    let after = switcher
        .current()
        .dispatch_http("web", get("slow.test", "/late"), None)
        .await;
    assert_eq!(after.status(), http::StatusCode::NOT_FOUND);

    // Every in-flight request completes on v1's handlers.
    for task in tasks {
        assert_eq!(task.await.unwrap(), http::StatusCode::OK);
    }

    // After the grace, both superseded runtimes are fully drained.
    tokio::time::sleep(Duration::from_millis(1200)).await;
    assert_eq!(metrics.snapshot().drains, 2);
}

#[tokio::test]
async fn equal_snapshots_build_equivalent_runtimes() {
    let u1 = spawn_upstream("u1", Duration::ZERO).await;

    let pairs = vec![
        pair("fluxgate/http/routers/rt/rule", "Host(`a.test`) && PathPrefix(`/api`)"),
        pair("fluxgate/http/routers/rt/service", "svc"),
        pair(
            "fluxgate/http/services/svc/loadbalancer/servers/0/url",
            format!("http://{u1}"),
        ),
    ];
    let cx = web_context();
    let runtime_a = runtime_from_pairs(&pairs, &cx);
    let runtime_b = runtime_from_pairs(&pairs, &cx);

    for (host, path, expected) in [
        ("a.test", "/api/x", http::StatusCode::OK),
        ("a.test", "/other", http::StatusCode::NOT_FOUND),
        ("b.test", "/api/x", http::StatusCode::NOT_FOUND),
    ] {
        let ra = runtime_a.dispatch_http("web", get(host, path), None).await;
        let rb = runtime_b.dispatch_http("web", get(host, path), None).await;
        assert_eq!(ra.status(), expected);
        assert_eq!(ra.status(), rb.status(), "host {host} path {path}");
    }
}
