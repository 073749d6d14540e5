//! Service handlers: load balancer, weighted composite, mirroring tee.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use http::{HeaderValue, StatusCode, header};
use http_body_util::BodyExt;
use parking_lot::Mutex;
use rand::Rng;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use fluxgate_core::config::StickyCookie;

use crate::handler::{Body, HttpHandler, Request, Response, SharedHandler, status_response};
use crate::proxy::{PrefixedBody, ProxyClient, Upstream};

/// Concurrent fire-and-forget mirror requests per mirroring service.
const MIRROR_BUDGET: usize = 32;

// ---------------------------------------------------------------------------
// Load balancer
// ---------------------------------------------------------------------------

/// Weighted round-robin over pooled upstreams, with optional sticky
/// cookie and health-gated selection.
pub struct LoadBalancerHandler {
    name: String,
    upstreams: Vec<Arc<Upstream>>,
    /// Smooth WRR state, one current weight per upstream.
    current: Mutex<Vec<i64>>,
    sticky: Option<StickyCookie>,
    pass_host_header: bool,
    client: ProxyClient,
    hard_cancel: CancellationToken,
}

impl LoadBalancerHandler {
    pub fn new(
        name: String,
        upstreams: Vec<Arc<Upstream>>,
        sticky: Option<StickyCookie>,
        pass_host_header: bool,
        hard_cancel: CancellationToken,
    ) -> Self {
        let current = Mutex::new(vec![0; upstreams.len()]);
        Self {
            name,
            upstreams,
            current,
            sticky,
            pass_host_header,
            client: ProxyClient::new(),
            hard_cancel,
        }
    }

    /// Smooth weighted round-robin over healthy upstreams.
    ///
    /// With equal weights this degenerates to plain round-robin; the
    /// selection is fully deterministic.
    fn pick(&self) -> Option<usize> {
        let mut current = self.current.lock();
        let mut total = 0;
        let mut best: Option<usize> = None;
        for (i, upstream) in self.upstreams.iter().enumerate() {
            if !upstream.healthy.load(Ordering::Relaxed) {
                continue;
            }
            current[i] += upstream.weight;
            total += upstream.weight;
            if best.is_none_or(|b| current[i] > current[b]) {
                best = Some(i);
            }
        }
        let best = best?;
        current[best] -= total;
        Some(best)
    }

    /// The upstream pinned by the affinity cookie, if valid and healthy.
    fn sticky_pick(&self, req: &Request) -> Option<usize> {
        let cookie = self.sticky.as_ref()?;
        let header = req.headers().get(header::COOKIE)?.to_str().ok()?;
        let value = header.split(';').find_map(|pair| {
            let (k, v) = pair.trim().split_once('=')?;
            (k == cookie.name).then_some(v)
        })?;
        let index: usize = value.parse().ok()?;
        let upstream = self.upstreams.get(index)?;
        upstream.healthy.load(Ordering::Relaxed).then_some(index)
    }

    fn set_cookie(&self, response: &mut Response, index: usize) {
        let Some(cookie) = &self.sticky else { return };
        let mut value = format!("{}={index}; Path=/", cookie.name);
        if cookie.http_only {
            value.push_str("; HttpOnly");
        }
        if cookie.secure {
            value.push_str("; Secure");
        }
        if let Ok(value) = HeaderValue::from_str(&value) {
            response.headers_mut().append(header::SET_COOKIE, value);
        }
    }
}

#[async_trait]
impl HttpHandler for LoadBalancerHandler {
    async fn handle(&self, req: Request) -> Response {
        let (index, from_cookie) = match self.sticky_pick(&req) {
            Some(index) => (Some(index), true),
            None => (self.pick(), false),
        };
        let Some(index) = index else {
            debug!(service = %self.name, "no healthy upstream");
            return status_response(StatusCode::SERVICE_UNAVAILABLE);
        };

        let upstream = &self.upstreams[index];
        let mut response = self
            .client
            .forward(req, upstream, self.pass_host_header, &self.hard_cancel)
            .await;
        if !from_cookie {
            self.set_cookie(&mut response, index);
        }
        response
    }
}

// ---------------------------------------------------------------------------
// Weighted composite
// ---------------------------------------------------------------------------

/// Virtual service selecting among child services by weight per request.
pub struct WeightedHandler {
    children: Vec<WeightedChild>,
    total_weight: i64,
    sticky: Option<StickyCookie>,
}

pub struct WeightedChild {
    pub name: String,
    pub weight: i64,
    pub handler: SharedHandler,
}

impl WeightedHandler {
    pub fn new(children: Vec<WeightedChild>, sticky: Option<StickyCookie>) -> Self {
        let total_weight = children.iter().map(|c| c.weight).sum();
        Self {
            children,
            total_weight,
            sticky,
        }
    }

    fn weighted_pick(&self) -> Option<usize> {
        if self.total_weight <= 0 {
            return None;
        }
        let mut roll = rand::rng().random_range(0..self.total_weight);
        for (i, child) in self.children.iter().enumerate() {
            roll -= child.weight;
            if roll < 0 {
                return Some(i);
            }
        }
        None
    }

    fn sticky_pick(&self, req: &Request) -> Option<usize> {
        let cookie = self.sticky.as_ref()?;
        let header = req.headers().get(header::COOKIE)?.to_str().ok()?;
        let value = header.split(';').find_map(|pair| {
            let (k, v) = pair.trim().split_once('=')?;
            (k == cookie.name).then_some(v)
        })?;
        let index: usize = value.parse().ok()?;
        (index < self.children.len()).then_some(index)
    }
}

#[async_trait]
impl HttpHandler for WeightedHandler {
    async fn handle(&self, req: Request) -> Response {
        let (index, from_cookie) = match self.sticky_pick(&req) {
            Some(index) => (Some(index), true),
            None => (self.weighted_pick(), false),
        };
        let Some(index) = index else {
            return status_response(StatusCode::SERVICE_UNAVAILABLE);
        };
        let child = &self.children[index];
        let mut response = child.handler.handle(req).await;

        if !from_cookie && let Some(cookie) = &self.sticky {
            let mut value = format!("{}={index}; Path=/", cookie.name);
            if cookie.http_only {
                value.push_str("; HttpOnly");
            }
            if cookie.secure {
                value.push_str("; Secure");
            }
            if let Ok(value) = HeaderValue::from_str(&value) {
                response.headers_mut().append(header::SET_COOKIE, value);
            }
        }
        response
    }
}

// ---------------------------------------------------------------------------
// Mirroring
// ---------------------------------------------------------------------------

/// Tee: the primary's response is the client's response; mirrors receive
/// fire-and-forget clones under a bounded task budget.
pub struct MirroringHandler {
    primary: SharedHandler,
    mirrors: Vec<MirrorTarget>,
    /// Largest body buffered for cloning; `-1` means unlimited.
    max_body_size: i64,
    budget: Arc<Semaphore>,
    tracker: TaskTracker,
}

pub struct MirrorTarget {
    pub name: String,
    pub percent: i64,
    pub handler: SharedHandler,
}

impl MirroringHandler {
    pub fn new(
        primary: SharedHandler,
        mirrors: Vec<MirrorTarget>,
        max_body_size: i64,
        tracker: TaskTracker,
    ) -> Self {
        Self {
            primary,
            mirrors,
            max_body_size,
            budget: Arc::new(Semaphore::new(MIRROR_BUDGET)),
            tracker,
        }
    }

    /// Buffer the request body up to the configured limit.
    ///
    /// Returns the buffered bytes and `true` when the whole body fit; on
    /// overflow the buffered prefix is returned so the primary's body can
    /// be reassembled, and mirroring is skipped.
    #[allow(clippy::cast_possible_wrap)]
    async fn buffer_body(&self, body: &mut Body) -> (BytesMut, bool) {
        let mut buffered = BytesMut::new();
        while let Some(frame) = body.frame().await {
            let Ok(frame) = frame else {
                return (buffered, false);
            };
            if let Ok(data) = frame.into_data() {
                buffered.extend_from_slice(&data);
                if self.max_body_size >= 0 && buffered.len() as i64 > self.max_body_size {
                    return (buffered, false);
                }
            }
        }
        (buffered, true)
    }

    fn clone_request(req: &http::request::Parts, body: Bytes) -> Request {
        let mut clone = http::Request::new(crate::handler::full_body(body));
        *clone.method_mut() = req.method.clone();
        *clone.uri_mut() = req.uri.clone();
        *clone.headers_mut() = req.headers.clone();
        *clone.version_mut() = req.version;
        clone
    }
}

#[async_trait]
impl HttpHandler for MirroringHandler {
    async fn handle(&self, req: Request) -> Response {
        let (parts, mut body) = req.into_parts();
        let (buffered, complete) = self.buffer_body(&mut body).await;
        let buffered = buffered.freeze();

        if complete {
            // Mirror before handing the buffer to the primary.
            for mirror in &self.mirrors {
                if rand::rng().random_range(0..100) >= mirror.percent {
                    continue;
                }
                let Ok(permit) = Arc::clone(&self.budget).try_acquire_owned() else {
                    debug!(mirror = %mirror.name, "mirror budget exhausted, skipping");
                    continue;
                };
                let clone = Self::clone_request(&parts, buffered.clone());
                let handler = Arc::clone(&mirror.handler);
                let name = mirror.name.clone();
                self.tracker.spawn(async move {
                    // The mirror's response is discarded.
                    let response = handler.handle(clone).await;
                    if response.status().is_server_error() {
                        warn!(mirror = %name, status = %response.status(), "mirror request failed");
                    }
                    drop(permit);
                });
            }
            let request = http::Request::from_parts(parts, crate::handler::full_body(buffered));
            self.primary.handle(request).await
        } else {
            // Body exceeded the mirror buffer: primary still sees the full
            // body, mirrors are skipped for this request.
            let reassembled = PrefixedBody::new(buffered, body);
            let request = http::Request::from_parts(parts, BodyExt::boxed(reassembled));
            self.primary.handle(request).await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::handler::full_body;
    use std::sync::atomic::AtomicU64;

    struct Recorder {
        status: StatusCode,
        hits: Arc<AtomicU64>,
    }

    #[async_trait]
    impl HttpHandler for Recorder {
        async fn handle(&self, req: Request) -> Response {
            let _ = req.into_body().collect().await;
            self.hits.fetch_add(1, Ordering::SeqCst);
            status_response(self.status)
        }
    }

    fn recorder(status: StatusCode) -> (SharedHandler, Arc<AtomicU64>) {
        let hits = Arc::new(AtomicU64::new(0));
        (
            Arc::new(Recorder {
                status,
                hits: Arc::clone(&hits),
            }),
            hits,
        )
    }

    fn request(body: &str) -> Request {
        http::Request::builder()
            .method(http::Method::POST)
            .uri("http://a.test/x")
            .body(full_body(body.to_owned()))
            .unwrap()
    }

    #[tokio::test]
    async fn weighted_zero_total_is_unavailable() {
        let (child, _) = recorder(StatusCode::OK);
        let handler = WeightedHandler::new(
            vec![WeightedChild {
                name: "a".to_owned(),
                weight: 0,
                handler: child,
            }],
            None,
        );
        let response = handler.handle(request("")).await;
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn weighted_single_child_always_selected() {
        let (child, hits) = recorder(StatusCode::OK);
        let handler = WeightedHandler::new(
            vec![WeightedChild {
                name: "a".to_owned(),
                weight: 5,
                handler: child,
            }],
            None,
        );
        for _ in 0..10 {
            let response = handler.handle(request("")).await;
            assert_eq!(response.status(), StatusCode::OK);
        }
        assert_eq!(hits.load(Ordering::SeqCst), 10);
    }

    #[tokio::test]
    async fn mirroring_client_sees_only_primary_response() {
        let (primary, primary_hits) = recorder(StatusCode::CREATED);
        let (mirror, mirror_hits) = recorder(StatusCode::INTERNAL_SERVER_ERROR);
        let tracker = TaskTracker::new();
        let handler = MirroringHandler::new(
            primary,
            vec![MirrorTarget {
                name: "shadow".to_owned(),
                percent: 100,
                handler: mirror,
            }],
            -1,
            tracker.clone(),
        );

        let response = handler.handle(request("payload")).await;
        assert_eq!(response.status(), StatusCode::CREATED);

        tracker.close();
        tracker.wait().await;
        assert_eq!(primary_hits.load(Ordering::SeqCst), 1);
        assert_eq!(mirror_hits.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn mirroring_zero_percent_never_mirrors() {
        let (primary, _) = recorder(StatusCode::OK);
        let (mirror, mirror_hits) = recorder(StatusCode::OK);
        let tracker = TaskTracker::new();
        let handler = MirroringHandler::new(
            primary,
            vec![MirrorTarget {
                name: "shadow".to_owned(),
                percent: 0,
                handler: mirror,
            }],
            -1,
            tracker.clone(),
        );

        for _ in 0..20 {
            handler.handle(request("x")).await;
        }
        tracker.close();
        tracker.wait().await;
        assert_eq!(mirror_hits.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn mirroring_oversized_body_skips_mirrors_but_reaches_primary() {
        let (primary, primary_hits) = recorder(StatusCode::OK);
        let (mirror, mirror_hits) = recorder(StatusCode::OK);
        let tracker = TaskTracker::new();
        let handler = MirroringHandler::new(
            primary,
            vec![MirrorTarget {
                name: "shadow".to_owned(),
                percent: 100,
                handler: mirror,
            }],
            4,
            tracker.clone(),
        );

        let response = handler.handle(request("longer than four bytes")).await;
        assert_eq!(response.status(), StatusCode::OK);
        tracker.close();
        tracker.wait().await;
        assert_eq!(primary_hits.load(Ordering::SeqCst), 1);
        assert_eq!(mirror_hits.load(Ordering::SeqCst), 0);
    }
}
