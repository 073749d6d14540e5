use thiserror::Error;

/// Errors from rule parsing and matcher compilation.
#[derive(Debug, Error)]
pub enum RuleError {
    /// The rule text does not conform to the grammar.
    #[error("parse error: {0}")]
    Parse(String),

    /// The rule uses a matcher the target protocol does not define.
    #[error("unknown matcher {0:?}")]
    UnknownMatcher(String),

    /// A matcher received the wrong number of arguments.
    #[error("matcher {0:?} expects {1}, got {2} argument(s)")]
    BadArity(String, &'static str, usize),

    /// A matcher argument failed to compile (bad regex, bad CIDR).
    #[error("invalid argument {arg:?} for {matcher}: {message}")]
    BadArgument {
        matcher: &'static str,
        arg: String,
        message: String,
    },
}
