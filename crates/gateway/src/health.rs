//! Active health checking of load-balancer upstreams.
//!
//! One probe loop per configured load balancer, spawned on the owning
//! runtime's task tracker and stopped by its background cancellation
//! token as part of drain.

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{info, warn};

use fluxgate_core::config::HealthCheck;

use crate::proxy::Upstream;

/// Spawn the probe loop for one load balancer.
pub fn spawn_health_checks(
    service: String,
    upstreams: Vec<Arc<Upstream>>,
    config: &HealthCheck,
    tracker: &TaskTracker,
    cancel: CancellationToken,
) {
    let interval = Duration::from_secs(config.interval);
    let timeout = Duration::from_secs(config.timeout);
    let path = if config.path.starts_with('/') {
        config.path.clone()
    } else {
        format!("/{}", config.path)
    };
    let port = config.port;
    let expected = config.status;

    tracker.spawn(async move {
        let client = match reqwest::Client::builder().timeout(timeout).build() {
            Ok(client) => client,
            Err(e) => {
                warn!(service = %service, error = %e, "health check client build failed");
                return;
            }
        };

        let mut ticker = tokio::time::interval(interval);
        loop {
            tokio::select! {
                () = cancel.cancelled() => return,
                _ = ticker.tick() => {}
            }
            for upstream in &upstreams {
                let url = probe_url(upstream, port, &path);
                let healthy = match client.get(&url).send().await {
                    Ok(response) => match expected {
                        Some(code) => response.status().as_u16() == code,
                        None => response.status().is_success() || response.status().is_redirection(),
                    },
                    Err(_) => false,
                };
                let was = upstream.healthy.swap(healthy, Ordering::Relaxed);
                if was != healthy {
                    if healthy {
                        info!(service = %service, upstream = %upstream.authority, "upstream back to healthy");
                    } else {
                        warn!(service = %service, upstream = %upstream.authority, "upstream marked unhealthy");
                    }
                }
            }
        }
    });
}

fn probe_url(upstream: &Upstream, port: Option<u16>, path: &str) -> String {
    let authority = match port {
        Some(port) => format!("{}:{port}", upstream.authority.host()),
        None => upstream.authority.to_string(),
    };
    format!("{}://{authority}{path}", upstream.scheme)
}
