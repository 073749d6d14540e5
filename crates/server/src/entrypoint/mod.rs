//! Entry point listeners.
//!
//! Listeners are long-lived and owned outside the core pipeline: a
//! runtime swap never rebinds a socket. Each accepted connection or
//! request loads the live runtime once and uses it for its entire
//! lifetime.

pub mod http;
pub mod tcp;
pub mod udp;

pub use http::HttpEntryPoint;
pub use tcp::TcpEntryPoint;
pub use udp::UdpEntryPoint;
