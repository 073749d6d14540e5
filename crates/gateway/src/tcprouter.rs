//! Per-entry-point TCP router tables and raw connection forwarding.
//!
//! After the entry point peeks the ClientHello (bounded, non-destructive),
//! the table picks the highest-priority matching router. Matched
//! connections are forwarded raw to a TCP service upstream; for TLS
//! passthrough the peeked bytes are replayed to the backend first.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tracing::{debug, warn};

use fluxgate_rules::{ConnMeta, TcpMatcher};

/// Dial timeout for upstream TCP connections.
const DIAL_TIMEOUT: Duration = Duration::from_secs(10);

/// One compiled TCP router.
pub struct TcpRouterEntry {
    /// Qualified router name.
    pub name: String,
    /// Effective priority (explicit, else rule length); the
    /// ``HostSNI(`*`)`` catch-all always sorts last.
    pub priority: i64,
    pub rule_len: usize,
    /// Catch-all routers match any connection, TLS or not.
    pub catch_all: bool,
    pub matcher: TcpMatcher,
    /// Where matched connections go.
    pub service: Arc<TcpUpstreams>,
    /// Replay the peeked ClientHello and forward the raw TLS stream.
    pub passthrough: bool,
}

/// Round-robin upstream addresses of one TCP service.
pub struct TcpUpstreams {
    /// Qualified service name.
    pub name: String,
    addresses: Vec<String>,
    next: AtomicUsize,
}

impl TcpUpstreams {
    pub fn new(name: String, addresses: Vec<String>) -> Self {
        Self {
            name,
            addresses,
            next: AtomicUsize::new(0),
        }
    }

    /// Next upstream address, plain round-robin.
    pub fn pick(&self) -> Option<&str> {
        if self.addresses.is_empty() {
            return None;
        }
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.addresses.len();
        self.addresses.get(index).map(String::as_str)
    }
}

/// The compiled TCP router table for one entry point.
pub struct TcpEntryPointRouter {
    /// Sorted: non-catch-all first by priority desc, catch-all last.
    entries: Vec<TcpRouterEntry>,
}

impl TcpEntryPointRouter {
    pub fn new(mut entries: Vec<TcpRouterEntry>) -> Self {
        entries.sort_by(|a, b| {
            a.catch_all
                .cmp(&b.catch_all)
                .then(b.priority.cmp(&a.priority))
                .then(b.rule_len.cmp(&a.rule_len))
                .then(a.name.cmp(&b.name))
        });
        Self { entries }
    }

    /// First matching router for a peeked connection.
    pub fn select(&self, meta: &ConnMeta<'_>) -> Option<&TcpRouterEntry> {
        self.entries.iter().find(|entry| entry.matcher.matches(meta))
    }

    pub fn entries(&self) -> &[TcpRouterEntry] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Forward an accepted connection to the routed upstream.
///
/// `peeked` holds the bytes consumed for SNI inspection; they are
/// prepended to the upstream stream so passthrough TLS handshakes see the
/// original byte sequence.
pub async fn forward_connection<S>(
    entry: &TcpRouterEntry,
    mut client: S,
    peeked: &[u8],
) -> std::io::Result<()>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let Some(address) = entry.service.pick() else {
        debug!(router = %entry.name, "tcp service has no upstreams");
        return Ok(());
    };

    let connect = tokio::time::timeout(DIAL_TIMEOUT, TcpStream::connect(address)).await;
    let mut upstream = match connect {
        Ok(Ok(stream)) => stream,
        Ok(Err(e)) => {
            warn!(router = %entry.name, upstream = %address, error = %e, "tcp dial failed");
            return Err(e);
        }
        Err(_) => {
            warn!(router = %entry.name, upstream = %address, "tcp dial timed out");
            return Err(std::io::Error::new(
                std::io::ErrorKind::TimedOut,
                "dial timeout",
            ));
        }
    };

    if !peeked.is_empty() {
        upstream.write_all(peeked).await?;
    }

    let (from_client, from_upstream) =
        tokio::io::copy_bidirectional(&mut client, &mut upstream).await?;
    debug!(
        router = %entry.name,
        upstream = %address,
        rx = from_client,
        tx = from_upstream,
        "tcp connection closed"
    );
    Ok(())
}
