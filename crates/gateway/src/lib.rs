//! Snapshot compilation and zero-downtime request routing.
//!
//! The pipeline: the aggregator's snapshots are flattened and validated,
//! the [`build`](build::build) step compiles matcher trees, middleware
//! chains and service handlers into an immutable [`Runtime`], and the
//! [`Switcher`] swaps it live under an atomic pointer while the previous
//! runtime drains in the background.

pub mod build;
pub mod error;
pub mod handler;
pub mod health;
pub mod httprouter;
pub mod metrics;
pub mod middleware;
pub mod proxy;
pub mod runtime;
pub mod service;
pub mod switcher;
pub mod tcprouter;
pub mod udprouter;
pub mod watcher;

pub use build::{BuildContext, InternalRouter, build as build_runtime};
pub use error::BuildError;
pub use handler::{
    Body, BoxError, HttpHandler, Request, RequestContext, Response, SharedHandler, empty_body,
    full_body, status_response,
};
pub use metrics::{GatewayMetrics, MetricsSnapshot};
pub use runtime::{EntityState, EntityStatus, Runtime, RuntimeStatus};
pub use switcher::{DEFAULT_DRAIN_GRACE, Switcher};
pub use watcher::WatcherLoop;
