//! The watcher loop: snapshots in, installed runtimes out.
//!
//! A single task subscribes to the aggregator, flattens each snapshot
//! into the qualified tree, builds, installs, and notifies API
//! subscribers. A second equality guard on the merged tree makes rebuilds
//! idempotent even if distinct provider payloads flatten to the same
//! configuration. Builder panics are converted to entity errors and can
//! never kill the loop.

use std::sync::Arc;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use fluxgate_core::{DynamicConfig, Snapshot, merge_snapshot};

use crate::build::{BuildContext, build};
use crate::metrics::GatewayMetrics;
use crate::runtime::RuntimeStatus;
use crate::switcher::Switcher;

pub struct WatcherLoop {
    subscription: watch::Receiver<Option<Snapshot>>,
    switcher: Arc<Switcher>,
    context: BuildContext,
    metrics: Arc<GatewayMetrics>,
    notify: watch::Sender<Arc<RuntimeStatus>>,
    cancel: CancellationToken,
    last_merged: Option<DynamicConfig>,
}

impl WatcherLoop {
    /// Wire the loop between the aggregator subscription and the switcher.
    ///
    /// `notify` carries each installed runtime's status to subscribers
    /// (the admin API); the caller owns the receiving side so the API can
    /// exist before the first build.
    pub fn new(
        subscription: watch::Receiver<Option<Snapshot>>,
        switcher: Arc<Switcher>,
        context: BuildContext,
        metrics: Arc<GatewayMetrics>,
        notify: watch::Sender<Arc<RuntimeStatus>>,
        cancel: CancellationToken,
    ) -> Self {
        notify.send_replace(switcher.current().status());
        Self {
            subscription,
            switcher,
            context,
            metrics,
            notify,
            cancel,
            last_merged: None,
        }
    }

    /// Run until cancelled or the aggregator goes away.
    pub async fn run(self) {
        let Self {
            mut subscription,
            switcher,
            context,
            metrics,
            notify,
            cancel,
            mut last_merged,
        } = self;

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    debug!("watcher loop cancelled");
                    return;
                }
                changed = subscription.changed() => {
                    if changed.is_err() {
                        debug!("aggregator channel closed, watcher loop exiting");
                        return;
                    }
                }
            }

            let Some(snapshot) = subscription.borrow_and_update().clone() else {
                continue;
            };

            let merged = merge_snapshot(&snapshot);
            if last_merged.as_ref() == Some(&merged) {
                debug!(revision = snapshot.revision, "merged tree unchanged, skipping rebuild");
                continue;
            }

            let runtime = build(merged.clone(), snapshot.revision, &context, &metrics);
            let status = runtime.status();
            switcher.install(runtime);
            last_merged = Some(merged);
            notify.send_replace(status);
        }
    }
}
