//! HTTP entry point: accept loop and per-connection serving.

use std::sync::Arc;
use std::time::{Duration, Instant};

use http_body_util::BodyExt;
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto;
use hyper_util::server::graceful::GracefulShutdown;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use fluxgate_gateway::{BoxError, Switcher};

use crate::accesslog::AccessLog;

/// One bound HTTP entry point.
pub struct HttpEntryPoint {
    name: String,
    listener: TcpListener,
    switcher: Arc<Switcher>,
    access_log: Arc<AccessLog>,
    cancel: CancellationToken,
    /// Bound on connection wind-down after the accept loop stops.
    shutdown_grace: Duration,
    connections: TaskTracker,
}

impl HttpEntryPoint {
    pub fn new(
        name: String,
        listener: TcpListener,
        switcher: Arc<Switcher>,
        access_log: Arc<AccessLog>,
        cancel: CancellationToken,
        shutdown_grace: Duration,
    ) -> Self {
        Self {
            name,
            listener,
            switcher,
            access_log,
            cancel,
            shutdown_grace,
            connections: TaskTracker::new(),
        }
    }

    /// Accept until cancelled, then wind down connections within the
    /// grace period: idle keep-alive connections close immediately,
    /// in-flight requests get to finish.
    pub async fn run(self) {
        let graceful = GracefulShutdown::new();
        let builder = auto::Builder::new(TokioExecutor::new());

        loop {
            let accepted = tokio::select! {
                () = self.cancel.cancelled() => break,
                accepted = self.listener.accept() => accepted,
            };
            let (stream, peer) = match accepted {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(entry_point = %self.name, error = %e, "accept failed");
                    continue;
                }
            };

            let entry_point = self.name.clone();
            let switcher = Arc::clone(&self.switcher);
            let access_log = Arc::clone(&self.access_log);
            let service = service_fn(move |req: hyper::Request<Incoming>| {
                let entry_point = entry_point.clone();
                let switcher = Arc::clone(&switcher);
                let access_log = Arc::clone(&access_log);
                async move {
                    let started = Instant::now();
                    let method = req.method().to_string();
                    let path = req.uri().path().to_owned();

                    // One runtime per request: the Arc pins it until the
                    // response (body included) is done.
                    let runtime = switcher.current();
                    let req = req.map(|b| b.map_err(BoxError::from).boxed());
                    let response = runtime
                        .dispatch_http(&entry_point, req, Some(peer.ip()))
                        .await;

                    access_log.record(
                        &entry_point,
                        &peer.ip().to_string(),
                        &method,
                        &path,
                        response.status().as_u16(),
                        started.elapsed(),
                    );
                    Ok::<_, std::convert::Infallible>(response)
                }
            });
            let connection = builder
                .serve_connection_with_upgrades(TokioIo::new(stream), service)
                .into_owned();
            let watched = graceful.watch(connection);
            self.connections.spawn(async move {
                if let Err(e) = watched.await {
                    debug!(peer = %peer, error = %e, "connection ended with error");
                }
            });
        }

        debug!(entry_point = %self.name, "http entry point stopped accepting");
        tokio::select! {
            () = graceful.shutdown() => {}
            () = tokio::time::sleep(self.shutdown_grace) => {
                debug!(entry_point = %self.name, "grace expired with connections open");
            }
        }
        self.connections.close();
        let _ = tokio::time::timeout(Duration::from_secs(1), self.connections.wait()).await;
    }
}
