use thiserror::Error;

/// Errors raised while compiling a single entity during a build.
///
/// These never abort a build: the offending entity is dropped and the
/// error is recorded as a
/// [`ConfigIssue`](fluxgate_core::ConfigIssue) on the runtime status.
#[derive(Debug, Error)]
pub enum BuildError {
    /// The entity's rule failed to parse or compile.
    #[error(transparent)]
    Rule(#[from] fluxgate_rules::RuleError),

    /// A referenced middleware does not exist in the snapshot.
    #[error("middleware {0:?} not found")]
    MiddlewareNotFound(String),

    /// A referenced service does not exist in the snapshot.
    #[error("service {0:?} not found")]
    ServiceNotFound(String),

    /// The middleware variant has no handler implementation.
    #[error("middleware type {0:?} is not supported")]
    UnsupportedMiddleware(&'static str),

    /// TLS termination was requested without a certificate resolver.
    #[error("tls termination requires a certificate resolver")]
    TlsTermination,

    /// An upstream server URL or address could not be parsed.
    #[error("invalid upstream {0:?}: {1}")]
    BadUpstream(String, String),

    /// A configured header name or value could not be parsed.
    #[error("invalid header {0:?}: {1}")]
    BadHeader(String, String),

    /// The load balancer strategy is not one this build supports.
    #[error("unsupported load balancer strategy {0:?}")]
    UnsupportedStrategy(String),

    /// A panic escaped an entity constructor and was converted.
    #[error("panic during build: {0}")]
    Panic(String),
}
