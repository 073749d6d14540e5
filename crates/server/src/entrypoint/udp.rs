//! UDP entry point: per-client sessions with idle expiry.
//!
//! Sessions are keyed by client address; each session lazily binds an
//! upstream socket on the first datagram and copies bidirectionally until
//! the idle timeout. Reply datagrams reuse the entry point's socket so
//! the client sees a stable peer.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::net::UdpSocket;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use fluxgate_gateway::Switcher;

const MAX_DATAGRAM: usize = 64 * 1024;
/// Queued datagrams per session before drops.
const SESSION_QUEUE: usize = 64;

/// One bound UDP entry point.
pub struct UdpEntryPoint {
    name: String,
    socket: Arc<UdpSocket>,
    switcher: Arc<Switcher>,
    idle_timeout: Duration,
    cancel: CancellationToken,
    sessions: Arc<DashMap<SocketAddr, mpsc::Sender<Vec<u8>>>>,
    tasks: TaskTracker,
}

impl UdpEntryPoint {
    pub fn new(
        name: String,
        socket: UdpSocket,
        switcher: Arc<Switcher>,
        idle_timeout: Duration,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            name,
            socket: Arc::new(socket),
            switcher,
            idle_timeout,
            cancel,
            sessions: Arc::new(DashMap::new()),
            tasks: TaskTracker::new(),
        }
    }

    /// Receive until cancelled; sessions drain on their own timers.
    pub async fn run(self) {
        let mut buf = vec![0_u8; MAX_DATAGRAM];
        loop {
            let received = tokio::select! {
                () = self.cancel.cancelled() => break,
                received = self.socket.recv_from(&mut buf) => received,
            };
            let (n, peer) = match received {
                Ok(pair) => pair,
                Err(e) => {
                    warn!(entry_point = %self.name, error = %e, "udp recv failed");
                    continue;
                }
            };
            self.handle_datagram(&buf[..n], peer);
        }

        debug!(entry_point = %self.name, "udp entry point stopped");
        self.tasks.close();
        self.tasks.wait().await;
    }

    fn handle_datagram(&self, datagram: &[u8], peer: SocketAddr) {
        if let Some(session) = self.sessions.get(&peer) {
            // Queue full means the upstream is not keeping up; dropping
            // matches datagram semantics.
            let _ = session.try_send(datagram.to_vec());
            return;
        }

        // New session: resolve the upstream from the live runtime.
        let runtime = self.switcher.current();
        let Some(upstreams) = runtime.udp_upstreams(&self.name) else {
            debug!(entry_point = %self.name, "no udp service bound");
            return;
        };
        let Some(upstream) = upstreams.pick().map(str::to_owned) else {
            debug!(entry_point = %self.name, "udp service has no upstreams");
            return;
        };

        let (tx, rx) = mpsc::channel(SESSION_QUEUE);
        if tx.try_send(datagram.to_vec()).is_err() {
            return;
        }
        self.sessions.insert(peer, tx);

        self.tasks.spawn(run_session(
            peer,
            upstream,
            rx,
            Arc::clone(&self.socket),
            self.idle_timeout,
            Arc::clone(&self.sessions),
            self.cancel.clone(),
        ));
    }
}

async fn run_session(
    peer: SocketAddr,
    upstream: String,
    mut from_client: mpsc::Receiver<Vec<u8>>,
    reply_socket: Arc<UdpSocket>,
    idle_timeout: Duration,
    sessions: Arc<DashMap<SocketAddr, mpsc::Sender<Vec<u8>>>>,
    cancel: CancellationToken,
) {
    let result = async {
        let socket = UdpSocket::bind("0.0.0.0:0").await?;
        socket.connect(&upstream).await?;

        let mut buf = vec![0_u8; MAX_DATAGRAM];
        loop {
            let idle = tokio::time::sleep(idle_timeout);
            tokio::select! {
                () = cancel.cancelled() => break,
                () = idle => break,
                datagram = from_client.recv() => match datagram {
                    Some(datagram) => {
                        socket.send(&datagram).await?;
                    }
                    None => break,
                },
                reply = socket.recv(&mut buf) => {
                    let n = reply?;
                    reply_socket.send_to(&buf[..n], peer).await?;
                }
            }
        }
        Ok::<_, std::io::Error>(())
    }
    .await;

    if let Err(e) = result {
        debug!(peer = %peer, upstream = %upstream, error = %e, "udp session error");
    }
    sessions.remove(&peer);
    debug!(peer = %peer, upstream = %upstream, "udp session closed");
}
