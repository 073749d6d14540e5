use thiserror::Error;

/// Errors from provider operations.
#[derive(Debug, Error)]
pub enum ProviderError {
    /// One-shot initialisation failed.
    #[error("init failed: {0}")]
    Init(String),

    /// The provider's transport to its configuration source failed.
    #[error("transport error: {0}")]
    Transport(String),

    /// A provider name was registered twice, or uses the reserved
    /// `internal` id.
    #[error("invalid provider name {0:?}: {1}")]
    InvalidName(String, &'static str),
}
