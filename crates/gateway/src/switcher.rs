//! The atomic runtime switcher.
//!
//! One `ArcSwap` holds the live runtime; every dispatch loads it with a
//! wait-free read. Installs swap the pointer and schedule the superseded
//! runtime's drain off the hot path. Installs are serialised by the
//! watcher loop; there is only one producer.

use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use tokio_util::task::TaskTracker;
use tracing::{debug, info};

use crate::metrics::GatewayMetrics;
use crate::runtime::Runtime;

/// Default drain grace for superseded runtimes.
pub const DEFAULT_DRAIN_GRACE: Duration = Duration::from_secs(10);

pub struct Switcher {
    current: ArcSwap<Runtime>,
    drain_grace: Duration,
    drains: TaskTracker,
    metrics: Arc<GatewayMetrics>,
}

impl Switcher {
    /// Create the switcher with its first runtime. From here on the live
    /// pointer is never null.
    pub fn new(initial: Runtime, drain_grace: Duration, metrics: Arc<GatewayMetrics>) -> Self {
        Self {
            current: ArcSwap::from_pointee(initial),
            drain_grace,
            drains: TaskTracker::new(),
            metrics,
        }
    }

    /// The live runtime. Wait-free; called on every request. The returned
    /// `Arc` pins the runtime for the caller's whole request lifetime.
    pub fn current(&self) -> Arc<Runtime> {
        self.current.load_full()
    }

    /// Install a new runtime and schedule the old one's drain.
    ///
    /// Drain is two-phase: background loops (health checks) stop
    /// immediately; in-flight requests get `drain_grace` to finish before
    /// the hard cancel cuts their upstream calls. The old runtime's
    /// connection pools close when its last `Arc` drops.
    pub fn install(&self, runtime: Runtime) {
        let revision = runtime.revision;
        let old = self.current.swap(Arc::new(runtime));
        self.metrics.increment_installs();
        info!(revision, old_revision = old.revision, "runtime installed");

        let grace = self.drain_grace;
        let metrics = Arc::clone(&self.metrics);
        self.drains.spawn(async move {
            old.begin_drain();
            tokio::time::sleep(grace).await;
            old.finish_drain();
            old.wait_background().await;
            metrics.increment_drains();
            debug!(revision = old.revision, "runtime drained");
        });
    }

    /// Drain the live runtime and wait for every pending drain. Called
    /// once at process shutdown.
    pub async fn shutdown(&self) {
        let live = self.current.load_full();
        live.begin_drain();
        tokio::time::sleep(self.drain_grace).await;
        live.finish_drain();
        live.wait_background().await;

        self.drains.close();
        self.drains.wait().await;
        info!("switcher shut down");
    }
}
