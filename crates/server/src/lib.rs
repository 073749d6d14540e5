//! Fluxgate server assembly: static configuration, entry point
//! listeners, the internal API, and process control.

pub mod accesslog;
pub mod api;
pub mod config;
pub mod entrypoint;
pub mod error;
pub mod server;
pub mod sni;
pub mod telemetry;

pub use accesslog::AccessLog;
pub use config::{Protocol, ServerConfig};
pub use error::ServerError;
pub use server::Server;
