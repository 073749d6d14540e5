//! The internal API: `/api/rawdata`, `/api/version`, `/ping`.
//!
//! Served through the regular dispatch path as `api@internal` /
//! `ping@internal` routers, so the admin surface rides the same entry
//! point machinery as user traffic while never being shadowed by it.

use std::sync::Arc;

use async_trait::async_trait;
use axum::Json;
use axum::extract::State;
use axum::routing::get;
use http_body_util::BodyExt;
use serde::Serialize;
use tokio::sync::watch;
use tower::ServiceExt;

use fluxgate_gateway::runtime::RuntimeStatus;
use fluxgate_gateway::{HttpHandler, Request, Response, full_body, status_response};

/// Crate version reported by `/api/version`.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
/// Release codename reported by `/api/version`.
pub const CODENAME: &str = "heron";

/// State shared by the API handlers.
#[derive(Clone)]
pub struct ApiState {
    /// Latest installed runtime's status, updated by the watcher loop.
    pub status: watch::Receiver<Arc<RuntimeStatus>>,
}

#[derive(Serialize)]
struct VersionPayload {
    version: &'static str,
    codename: &'static str,
}

async fn rawdata(State(state): State<ApiState>) -> Json<Arc<RuntimeStatus>> {
    Json(state.status.borrow().clone())
}

async fn version() -> Json<VersionPayload> {
    Json(VersionPayload {
        version: VERSION,
        codename: CODENAME,
    })
}

async fn ping() -> &'static str {
    "OK"
}

/// Build the axum router for the internal API.
pub fn router(state: ApiState) -> axum::Router {
    axum::Router::new()
        .route("/api/rawdata", get(rawdata))
        .route("/api/version", get(version))
        .route("/ping", get(ping))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

/// Bridges the axum router into the gateway's handler seam so internal
/// routers compose like any other.
pub struct InternalApiHandler {
    router: axum::Router,
}

impl InternalApiHandler {
    pub fn new(router: axum::Router) -> Self {
        Self { router }
    }
}

#[async_trait]
impl HttpHandler for InternalApiHandler {
    async fn handle(&self, req: Request) -> Response {
        let request = req.map(axum::body::Body::new);
        match self.router.clone().oneshot(request).await {
            Ok(response) => {
                let (parts, body) = response.into_parts();
                match body.collect().await {
                    Ok(collected) => {
                        http::Response::from_parts(parts, full_body(collected.to_bytes()))
                    }
                    Err(_) => status_response(http::StatusCode::INTERNAL_SERVER_ERROR),
                }
            }
            // Router's error is Infallible; this arm is unreachable.
            Err(_) => status_response(http::StatusCode::INTERNAL_SERVER_ERROR),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use fluxgate_core::DynamicConfig;
    use fluxgate_gateway::empty_body;

    fn state_with_empty_status() -> ApiState {
        let status = RuntimeStatus::assemble(3, DynamicConfig::default(), &[]);
        let (_tx, rx) = watch::channel(Arc::new(status));
        ApiState { status: rx }
    }

    fn get_request(path: &str) -> Request {
        http::Request::builder()
            .uri(path)
            .body(empty_body())
            .unwrap()
    }

    async fn body_json(response: Response) -> serde_json::Value {
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn ping_answers_ok() {
        let handler = InternalApiHandler::new(router(state_with_empty_status()));
        let response = handler.handle(get_request("/ping")).await;
        assert_eq!(response.status(), http::StatusCode::OK);
    }

    #[tokio::test]
    async fn version_reports_crate_version() {
        let handler = InternalApiHandler::new(router(state_with_empty_status()));
        let response = handler.handle(get_request("/api/version")).await;
        let json = body_json(response).await;
        assert_eq!(json["version"], VERSION);
        assert_eq!(json["codename"], CODENAME);
    }

    #[tokio::test]
    async fn rawdata_reflects_runtime_status() {
        let handler = InternalApiHandler::new(router(state_with_empty_status()));
        let response = handler.handle(get_request("/api/rawdata")).await;
        let json = body_json(response).await;
        assert_eq!(json["revision"], 3);
        assert!(json["entities"].is_object());
    }

    #[tokio::test]
    async fn unknown_api_path_is_404() {
        let handler = InternalApiHandler::new(router(state_with_empty_status()));
        let response = handler.handle(get_request("/api/nope")).await;
        assert_eq!(response.status(), http::StatusCode::NOT_FOUND);
    }
}
