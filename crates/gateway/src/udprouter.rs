//! UDP routing: entry point to service, no rule language.

use std::sync::atomic::{AtomicUsize, Ordering};

/// Round-robin upstream addresses for one UDP entry point.
///
/// Session handling (client address to upstream socket binding with idle
/// expiry) lives with the entry point listener; new sessions pick their
/// upstream here.
pub struct UdpUpstreams {
    /// Qualified router name serving this entry point.
    pub router: String,
    /// Qualified service name.
    pub service: String,
    addresses: Vec<String>,
    next: AtomicUsize,
}

impl UdpUpstreams {
    pub fn new(router: String, service: String, addresses: Vec<String>) -> Self {
        Self {
            router,
            service,
            addresses,
            next: AtomicUsize::new(0),
        }
    }

    /// Upstream address for a new session, plain round-robin.
    pub fn pick(&self) -> Option<&str> {
        if self.addresses.is_empty() {
            return None;
        }
        let index = self.next.fetch_add(1, Ordering::Relaxed) % self.addresses.len();
        self.addresses.get(index).map(String::as_str)
    }
}
