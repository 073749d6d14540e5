//! The provider port and the snapshot aggregator.
//!
//! Providers are independent tasks that push their full configuration view
//! onto one shared channel whenever it changes. The aggregator fans the
//! streams in, deduplicates per provider by deep equality, and publishes
//! throttled [`Snapshot`](fluxgate_core::Snapshot)s downstream.

pub mod aggregator;
pub mod error;
pub mod memory;
pub mod provider;

pub use aggregator::{Aggregator, AggregatorMetrics, AggregatorMetricsSnapshot};
pub use error::ProviderError;
pub use memory::{MemoryHandle, MemoryProvider};
pub use provider::{DynProvider, Provider, ProviderRegistry};
