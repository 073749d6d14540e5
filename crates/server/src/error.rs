use thiserror::Error;

/// Fatal server errors. Anything surfacing here aborts startup before the
/// process serves traffic; per-entity and per-request problems never do.
#[derive(Debug, Error)]
pub enum ServerError {
    /// The static configuration file could not be read.
    #[error("cannot read config {path:?}: {source}")]
    ConfigRead {
        path: String,
        source: std::io::Error,
    },

    /// The static configuration file could not be parsed.
    #[error("malformed config {path:?}: {source}")]
    ConfigParse {
        path: String,
        source: toml::de::Error,
    },

    /// An entry point address could not be bound.
    #[error("cannot bind entry point {name:?} on {address:?}: {source}")]
    Bind {
        name: String,
        address: String,
        source: std::io::Error,
    },

    /// A provider failed to register (duplicate or reserved name).
    #[error(transparent)]
    Provider(#[from] fluxgate_provider::ProviderError),

    /// The access log file could not be opened.
    #[error("cannot open access log {path:?}: {source}")]
    AccessLog {
        path: String,
        source: std::io::Error,
    },
}
