use std::sync::atomic::{AtomicU64, Ordering};

/// Atomic counters tracking the configuration pipeline and the data plane.
///
/// All counters use relaxed ordering for throughput; call
/// [`snapshot`](Self::snapshot) for a consistent point-in-time view.
#[derive(Debug, Default)]
pub struct GatewayMetrics {
    /// Runtime builds performed.
    pub builds: AtomicU64,
    /// Entities dropped with an error across all builds.
    pub build_entity_errors: AtomicU64,
    /// Runtimes installed by the switcher.
    pub installs: AtomicU64,
    /// Superseded runtimes fully drained.
    pub drains: AtomicU64,
    /// HTTP requests dispatched.
    pub http_requests: AtomicU64,
    /// HTTP requests that matched no router.
    pub http_not_found: AtomicU64,
    /// Upstream failures answered with 502/503/504.
    pub upstream_errors: AtomicU64,
    /// TCP connections routed.
    pub tcp_connections: AtomicU64,
    /// UDP sessions opened.
    pub udp_sessions: AtomicU64,
}

impl GatewayMetrics {
    pub fn increment_builds(&self) {
        self.builds.fetch_add(1, Ordering::Relaxed);
    }

    pub fn add_build_entity_errors(&self, n: u64) {
        self.build_entity_errors.fetch_add(n, Ordering::Relaxed);
    }

    pub fn increment_installs(&self) {
        self.installs.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_drains(&self) {
        self.drains.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_http_requests(&self) {
        self.http_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_http_not_found(&self) {
        self.http_not_found.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_upstream_errors(&self) {
        self.upstream_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_tcp_connections(&self) {
        self.tcp_connections.fetch_add(1, Ordering::Relaxed);
    }

    pub fn increment_udp_sessions(&self) {
        self.udp_sessions.fetch_add(1, Ordering::Relaxed);
    }

    /// Take a consistent point-in-time snapshot of all counters.
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            builds: self.builds.load(Ordering::Relaxed),
            build_entity_errors: self.build_entity_errors.load(Ordering::Relaxed),
            installs: self.installs.load(Ordering::Relaxed),
            drains: self.drains.load(Ordering::Relaxed),
            http_requests: self.http_requests.load(Ordering::Relaxed),
            http_not_found: self.http_not_found.load(Ordering::Relaxed),
            upstream_errors: self.upstream_errors.load(Ordering::Relaxed),
            tcp_connections: self.tcp_connections.load(Ordering::Relaxed),
            udp_sessions: self.udp_sessions.load(Ordering::Relaxed),
        }
    }
}

/// A plain data snapshot of [`GatewayMetrics`] at a point in time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub builds: u64,
    pub build_entity_errors: u64,
    pub installs: u64,
    pub drains: u64,
    pub http_requests: u64,
    pub http_not_found: u64,
    pub upstream_errors: u64,
    pub tcp_connections: u64,
    pub udp_sessions: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_metrics_are_zero() {
        let m = GatewayMetrics::default();
        let snap = m.snapshot();
        assert_eq!(snap.builds, 0);
        assert_eq!(snap.http_requests, 0);
        assert_eq!(snap.udp_sessions, 0);
    }

    #[test]
    fn increment_and_snapshot() {
        let m = GatewayMetrics::default();
        m.increment_builds();
        m.increment_builds();
        m.add_build_entity_errors(3);
        m.increment_http_requests();
        m.increment_http_not_found();

        let snap = m.snapshot();
        assert_eq!(snap.builds, 2);
        assert_eq!(snap.build_entity_errors, 3);
        assert_eq!(snap.http_requests, 1);
        assert_eq!(snap.http_not_found, 1);
    }
}
