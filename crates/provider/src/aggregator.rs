//! Fan-in of provider messages into throttled snapshots.
//!
//! The aggregator is a single task, so its per-provider state needs no
//! lock. Output goes through a `watch` channel: downstream always observes
//! the latest published snapshot, which gives the required coalescing
//! without ever blocking producers.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use tokio::sync::{mpsc, watch};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use fluxgate_core::{ConfigMessage, DynamicConfig, ProviderId, Snapshot};

/// Default minimum interval between snapshot publications.
pub const DEFAULT_THROTTLE: Duration = Duration::from_secs(2);

/// Atomic counters tracking aggregator behavior.
///
/// All counters use relaxed ordering; call [`snapshot`](Self::snapshot)
/// for a point-in-time view.
#[derive(Debug, Default)]
pub struct AggregatorMetrics {
    /// Snapshots published downstream.
    pub published: AtomicU64,
    /// Messages folded into an already-pending publish tick.
    pub coalesced: AtomicU64,
    /// Messages discarded because the payload equalled the provider's
    /// previous one.
    pub deduped: AtomicU64,
    /// Messages received, per provider.
    received: parking_lot::RwLock<BTreeMap<String, u64>>,
}

impl AggregatorMetrics {
    fn record_received(&self, provider: &ProviderId) {
        let mut map = self.received.write();
        *map.entry(provider.as_str().to_owned()).or_insert(0) += 1;
    }

    /// Take a consistent point-in-time snapshot of all counters.
    pub fn snapshot(&self) -> AggregatorMetricsSnapshot {
        AggregatorMetricsSnapshot {
            published: self.published.load(Ordering::Relaxed),
            coalesced: self.coalesced.load(Ordering::Relaxed),
            deduped: self.deduped.load(Ordering::Relaxed),
            received: self.received.read().clone(),
        }
    }
}

/// Plain data snapshot of [`AggregatorMetrics`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AggregatorMetricsSnapshot {
    pub published: u64,
    pub coalesced: u64,
    pub deduped: u64,
    pub received: BTreeMap<String, u64>,
}

/// The fan-in task. Create with [`Aggregator::new`], then `await`
/// [`run`](Self::run) on a dedicated task.
pub struct Aggregator {
    input: mpsc::Receiver<ConfigMessage>,
    output: watch::Sender<Option<Snapshot>>,
    throttle: Duration,
    metrics: Arc<AggregatorMetrics>,
    cancel: CancellationToken,
}

impl Aggregator {
    /// Build an aggregator reading from `input`.
    ///
    /// Returns the task value, the snapshot subscription, and the metrics
    /// handle.
    pub fn new(
        input: mpsc::Receiver<ConfigMessage>,
        throttle: Duration,
        cancel: CancellationToken,
    ) -> (Self, watch::Receiver<Option<Snapshot>>, Arc<AggregatorMetrics>) {
        let (output, subscription) = watch::channel(None);
        let metrics = Arc::new(AggregatorMetrics::default());
        (
            Self {
                input,
                output,
                throttle,
                metrics: Arc::clone(&metrics),
                cancel,
            },
            subscription,
            metrics,
        )
    }

    /// Run until cancellation or input close.
    ///
    /// On input close any pending dirty state is published immediately; on
    /// cancellation the task exits without publishing partial state.
    pub async fn run(self) {
        let Self {
            mut input,
            output,
            throttle,
            metrics,
            cancel,
        } = self;

        let mut configs: BTreeMap<ProviderId, DynamicConfig> = BTreeMap::new();
        let mut revision: u64 = 0;
        let mut pending: Option<Instant> = None;

        loop {
            tokio::select! {
                () = cancel.cancelled() => {
                    debug!("aggregator cancelled");
                    break;
                }
                message = input.recv() => match message {
                    Some(message) => {
                        accept(&metrics, throttle, message, &mut configs, &mut pending);
                    }
                    None => {
                        if pending.is_some() {
                            publish(&metrics, &output, &configs, &mut revision);
                        }
                        debug!("aggregator input closed");
                        break;
                    }
                },
                () = sleep_until_opt(pending), if pending.is_some() => {
                    publish(&metrics, &output, &configs, &mut revision);
                    pending = None;
                }
            }
        }
    }
}

fn accept(
    metrics: &AggregatorMetrics,
    throttle: Duration,
    message: ConfigMessage,
    configs: &mut BTreeMap<ProviderId, DynamicConfig>,
    pending: &mut Option<Instant>,
) {
    metrics.record_received(&message.provider);

    if configs.get(&message.provider) == Some(&message.config) {
        metrics.deduped.fetch_add(1, Ordering::Relaxed);
        debug!(provider = %message.provider, "unchanged payload discarded");
        return;
    }
    configs.insert(message.provider, message.config);

    if pending.is_some() {
        // A publish is already scheduled; the tick will see this state.
        metrics.coalesced.fetch_add(1, Ordering::Relaxed);
    } else {
        *pending = Some(Instant::now() + throttle);
    }
}

fn publish(
    metrics: &AggregatorMetrics,
    output: &watch::Sender<Option<Snapshot>>,
    configs: &BTreeMap<ProviderId, DynamicConfig>,
    revision: &mut u64,
) {
    *revision += 1;
    let snapshot = Snapshot {
        // Shallow clone is fine: payloads are never mutated in place.
        configs: configs.clone(),
        revision: *revision,
    };
    info!(revision = *revision, providers = configs.len(), "snapshot published");
    metrics.published.fetch_add(1, Ordering::Relaxed);
    output.send_replace(Some(snapshot));
}

async fn sleep_until_opt(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
