//! TCP entry point: SNI peek and raw forwarding.

use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use fluxgate_gateway::Switcher;
use fluxgate_gateway::tcprouter::forward_connection;
use fluxgate_rules::ConnMeta;

use crate::sni::{ClientHello, PeekOutcome, inspect};

/// Largest ClientHello we are willing to peek.
const PEEK_LIMIT: usize = 16 * 1024;
/// Total budget for the peek, covering slow clients.
const PEEK_TIMEOUT: Duration = Duration::from_secs(3);
/// Delay between peek attempts while a record is incomplete.
const PEEK_RETRY: Duration = Duration::from_millis(20);

/// One bound TCP entry point.
pub struct TcpEntryPoint {
    name: String,
    listener: tokio::net::TcpListener,
    switcher: Arc<Switcher>,
    cancel: CancellationToken,
    /// Bound on connection wind-down after the accept loop stops.
    shutdown_grace: Duration,
    connections: TaskTracker,
}

impl TcpEntryPoint {
    pub fn new(
        name: String,
        listener: tokio::net::TcpListener,
        switcher: Arc<Switcher>,
        cancel: CancellationToken,
        shutdown_grace: Duration,
    ) -> Self {
        Self {
            name,
            listener,
            switcher,
            cancel,
            shutdown_grace,
            connections: TaskTracker::new(),
        }
    }

    /// Accept until cancelled, then let in-flight connections finish.
    pub async fn run(self) {
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
            let name = self.name.clone();
            let switcher = Arc::clone(&self.switcher);
            self.connections.spawn(async move {
                route_connection(&name, stream, peer.ip(), &switcher).await;
            });
        }

        debug!(entry_point = %self.name, "tcp entry point stopped accepting");
        self.connections.close();
        // Long-lived raw connections do not outlive the grace period.
        let _ = tokio::time::timeout(self.shutdown_grace, self.connections.wait()).await;
    }
}

async fn route_connection(
    entry_point: &str,
    stream: TcpStream,
    peer_ip: std::net::IpAddr,
    switcher: &Switcher,
) {
    let hello = match peek_client_hello(&stream).await {
        Ok(outcome) => outcome,
        Err(e) => {
            debug!(entry_point, error = %e, "peek failed, dropping connection");
            return;
        }
    };

    // The runtime observed here serves the whole connection.
    let runtime = switcher.current();
    let Some(router) = runtime.tcp_router(entry_point) else {
        debug!(entry_point, "no tcp routers configured");
        return;
    };

    let meta = ConnMeta {
        sni: hello.as_ref().and_then(|h| h.sni.as_deref()),
        client_ip: Some(peer_ip),
        alpn: hello.as_ref().map_or(&[], |h| h.alpn.as_slice()),
    };
    let Some(entry) = router.select(&meta) else {
        debug!(entry_point, sni = ?meta.sni, "no tcp router matched");
        return;
    };

    // Peeking never consumed bytes, so nothing needs replaying; the
    // upstream sees the stream (TLS handshake included) from its start.
    if let Err(e) = forward_connection(entry, stream, &[]).await {
        debug!(entry_point, router = %entry.name, error = %e, "tcp forward failed");
    }
}

/// Peek the start of the stream; `None` means plain TCP.
async fn peek_client_hello(stream: &TcpStream) -> std::io::Result<Option<ClientHello>> {
    let mut buf = vec![0_u8; PEEK_LIMIT];
    let deadline = tokio::time::Instant::now() + PEEK_TIMEOUT;

    loop {
        // A silent client (server-first protocol) routes as plain TCP.
        let Ok(peeked) = tokio::time::timeout_at(deadline, stream.peek(&mut buf)).await else {
            return Ok(None);
        };
        let n = peeked?;
        match inspect(&buf[..n]) {
            PeekOutcome::NotTls => return Ok(None),
            PeekOutcome::Tls(hello) => return Ok(Some(hello)),
            PeekOutcome::Incomplete => {
                if tokio::time::Instant::now() >= deadline || n == buf.len() {
                    // Give up parsing; treat as anonymous TLS so only
                    // catch-all rules can claim the connection.
                    return Ok(Some(ClientHello::default()));
                }
                tokio::time::sleep(PEEK_RETRY).await;
            }
        }
    }
}
