//! Process assembly: bind, wire the pipeline, serve, drain.

use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::{TcpListener, UdpSocket};
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::info;

use fluxgate_core::DynamicConfig;
use fluxgate_gateway::build::{BuildContext, InternalRouter, build};
use fluxgate_gateway::runtime::RuntimeStatus;
use fluxgate_gateway::{GatewayMetrics, Switcher, WatcherLoop};
use fluxgate_provider::{Aggregator, ProviderRegistry};

use crate::accesslog::AccessLog;
use crate::api::{ApiState, InternalApiHandler};
use crate::config::{Protocol, ServerConfig};
use crate::entrypoint::{HttpEntryPoint, TcpEntryPoint, UdpEntryPoint};
use crate::error::ServerError;

/// Channel depth between providers and the aggregator. The aggregator
/// always drains, so this only buffers bursts.
const AGGREGATION_QUEUE: usize = 256;

/// A bound, not-yet-serving Fluxgate process.
///
/// Binding is separated from serving so startup failures (port in use,
/// malformed config) abort before any traffic is accepted, with a
/// non-zero exit.
pub struct Server {
    config: ServerConfig,
    registry: ProviderRegistry,
    http_listeners: Vec<(String, TcpListener)>,
    tcp_listeners: Vec<(String, TcpListener)>,
    udp_sockets: Vec<(String, UdpSocket, Duration)>,
    addresses: BTreeMap<String, SocketAddr>,
    access_log: Arc<AccessLog>,
    metrics: Arc<GatewayMetrics>,
}

impl Server {
    /// Bind every configured entry point and open the access log.
    pub async fn bind(
        mut config: ServerConfig,
        registry: ProviderRegistry,
    ) -> Result<Self, ServerError> {
        config.ensure_internal_entry_point();
        let access_log = Arc::new(AccessLog::open(&config.access_log.file_path)?);

        let mut http_listeners = Vec::new();
        let mut tcp_listeners = Vec::new();
        let mut udp_sockets = Vec::new();
        let mut addresses = BTreeMap::new();

        for (name, ep) in &config.entry_points {
            match ep.protocol {
                Protocol::Http | Protocol::Tcp => {
                    let listener = TcpListener::bind(&ep.address).await.map_err(|source| {
                        ServerError::Bind {
                            name: name.clone(),
                            address: ep.address.clone(),
                            source,
                        }
                    })?;
                    if let Ok(addr) = listener.local_addr() {
                        addresses.insert(name.clone(), addr);
                    }
                    if ep.protocol == Protocol::Http {
                        http_listeners.push((name.clone(), listener));
                    } else {
                        tcp_listeners.push((name.clone(), listener));
                    }
                }
                Protocol::Udp => {
                    let socket = UdpSocket::bind(&ep.address).await.map_err(|source| {
                        ServerError::Bind {
                            name: name.clone(),
                            address: ep.address.clone(),
                            source,
                        }
                    })?;
                    if let Ok(addr) = socket.local_addr() {
                        addresses.insert(name.clone(), addr);
                    }
                    udp_sockets.push((
                        name.clone(),
                        socket,
                        Duration::from_secs(ep.idle_timeout),
                    ));
                }
            }
            info!(entry_point = %name, address = %ep.address, protocol = ?ep.protocol, "entry point bound");
        }

        Ok(Self {
            config,
            registry,
            http_listeners,
            tcp_listeners,
            udp_sockets,
            addresses,
            access_log,
            metrics: Arc::new(GatewayMetrics::default()),
        })
    }

    /// The actual bound address of an entry point (useful with `:0`).
    pub fn local_addr(&self, entry_point: &str) -> Option<SocketAddr> {
        self.addresses.get(entry_point).copied()
    }

    /// Handle for the signal task that reopens the access log.
    pub fn access_log(&self) -> Arc<AccessLog> {
        Arc::clone(&self.access_log)
    }

    /// Gateway metrics handle.
    pub fn metrics(&self) -> Arc<GatewayMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Serve until `shutdown` fires, then drain gracefully.
    pub async fn run(self, shutdown: CancellationToken) {
        let throttle = self.config.pipeline.throttle();
        let grace = self.config.pipeline.grace();

        // Providers fan into the aggregator; the watcher loop consumes
        // its throttled snapshots.
        let (message_tx, message_rx) = mpsc::channel(AGGREGATION_QUEUE);
        let (aggregator, subscription, _aggregator_metrics) =
            Aggregator::new(message_rx, throttle, shutdown.child_token());

        let pipeline = TaskTracker::new();
        pipeline.spawn(aggregator.run());

        // The admin API reads the latest installed runtime's status.
        let (status_tx, status_rx) = watch::channel(Arc::new(RuntimeStatus::assemble(
            0,
            DynamicConfig::default(),
            &[],
        )));

        let context = self.build_context(status_rx);
        let boot = build(DynamicConfig::default(), 0, &context, &self.metrics);
        let switcher = Arc::new(Switcher::new(boot, grace, Arc::clone(&self.metrics)));

        let watcher = WatcherLoop::new(
            subscription,
            Arc::clone(&switcher),
            context,
            Arc::clone(&self.metrics),
            status_tx,
            shutdown.child_token(),
        );
        pipeline.spawn(watcher.run());

        let providers = TaskTracker::new();
        self.registry
            .launch(message_tx, &providers, shutdown.child_token())
            .await;
        providers.close();

        // Entry point listeners, long-lived across runtime swaps.
        let listeners = TaskTracker::new();
        for (name, listener) in self.http_listeners {
            listeners.spawn(
                HttpEntryPoint::new(
                    name,
                    listener,
                    Arc::clone(&switcher),
                    Arc::clone(&self.access_log),
                    shutdown.child_token(),
                    grace,
                )
                .run(),
            );
        }
        for (name, listener) in self.tcp_listeners {
            listeners.spawn(
                TcpEntryPoint::new(
                    name,
                    listener,
                    Arc::clone(&switcher),
                    shutdown.child_token(),
                    grace,
                )
                .run(),
            );
        }
        for (name, socket, idle) in self.udp_sockets {
            listeners.spawn(
                UdpEntryPoint::new(
                    name,
                    socket,
                    Arc::clone(&switcher),
                    idle,
                    shutdown.child_token(),
                )
                .run(),
            );
        }
        listeners.close();

        info!("serving");
        shutdown.cancelled().await;
        info!("shutting down");

        // Stop accepting and let provider tasks wind down; the aggregator
        // flushes pending state when the last sender drops.
        listeners.wait().await;
        providers.wait().await;
        pipeline.close();
        pipeline.wait().await;

        // Drain the live runtime within the grace period.
        switcher.shutdown().await;
        info!("shutdown complete");
    }

    fn build_context(&self, status_rx: watch::Receiver<Arc<RuntimeStatus>>) -> BuildContext {
        let mut internal_routers = Vec::new();
        if self.config.api.enabled {
            let handler = Arc::new(InternalApiHandler::new(crate::api::router(ApiState {
                status: status_rx,
            })));
            internal_routers.push(InternalRouter {
                name: "api@internal".to_owned(),
                rule: "PathPrefix(`/api`)".to_owned(),
                priority: i64::from(i32::MAX),
                entry_points: vec![self.config.api.entry_point.clone()],
                handler: Arc::clone(&handler) as _,
            });
            internal_routers.push(InternalRouter {
                name: "ping@internal".to_owned(),
                rule: "Path(`/ping`)".to_owned(),
                priority: i64::from(i32::MAX),
                entry_points: vec![self.config.api.entry_point.clone()],
                handler,
            });
        }

        BuildContext {
            http_entry_points: self.config.entry_point_names(Protocol::Http),
            tcp_entry_points: self.config.entry_point_names(Protocol::Tcp),
            udp_entry_points: self.config.entry_point_names(Protocol::Udp),
            internal_routers,
        }
    }
}
