use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors produced while decoding flat key-value paths into a
/// [`DynamicConfig`](crate::DynamicConfig).
#[derive(Debug, Error)]
pub enum KvError {
    /// A key did not start with the expected root segment.
    #[error("key {0:?} does not start with root {1:?}")]
    BadRoot(String, String),

    /// A key was too short to address a configuration entity.
    #[error("key {0:?} is too short")]
    ShortKey(String),

    /// A key addressed an unknown top-level section.
    #[error("unknown section {section:?} in key {key:?}")]
    UnknownSection { key: String, section: String },

    /// The assembled tree did not deserialize into the typed model.
    #[error("decode error: {0}")]
    Decode(#[from] serde_json::Error),
}

/// Which part of the dynamic configuration an issue belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum IssueScope {
    HttpRouter,
    HttpService,
    HttpMiddleware,
    TcpRouter,
    TcpService,
    UdpRouter,
    UdpService,
}

/// A recorded problem with a single named entity.
///
/// Issues never abort a validation or build pass; the offending entity is
/// dropped and the issue is surfaced through the runtime status map and the
/// `/api/rawdata` endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConfigIssue {
    /// The section the entity lives in.
    pub scope: IssueScope,
    /// The fully qualified entity name (`local@provider`).
    pub name: String,
    /// Human-readable description of the problem.
    pub message: String,
}

impl ConfigIssue {
    /// Convenience constructor.
    pub fn new(scope: IssueScope, name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            scope,
            name: name.into(),
            message: message.into(),
        }
    }
}
