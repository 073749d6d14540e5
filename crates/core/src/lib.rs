//! Core types for the Fluxgate edge router: the dynamic configuration
//! model, provider messages and snapshots, name qualification, KV path
//! decoding, and the pre-build validation pass.
//!
//! Everything in this crate is a plain value type. Configuration payloads
//! are never mutated after they have been handed to the aggregator; deep
//! equality (`PartialEq`) is the dedup primitive throughout the pipeline.

pub mod config;
pub mod error;
pub mod kv;
pub mod message;
pub mod name;
pub mod qualify;
pub mod validate;

pub use config::{DynamicConfig, HttpConfig, TcpConfig, UdpConfig};
pub use error::{ConfigIssue, IssueScope, KvError};
pub use message::{ConfigMessage, ProviderId, Snapshot};
pub use name::{INTERNAL_PROVIDER, provider_of, qualify_name};
pub use qualify::merge_snapshot;
pub use validate::validate;
