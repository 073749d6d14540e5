//! Qualified entity names.
//!
//! Every entity in a compiled runtime is addressed as `local@provider`; the
//! `@provider` suffix is the sole collision breaker between providers. Bare
//! references inside one provider's payload resolve to that same provider.

/// The reserved provider id for entities owned by the process itself
/// (the internal API router among them). External providers must not use it.
pub const INTERNAL_PROVIDER: &str = "internal";

/// Qualify `name` with `provider` unless it already carries a qualifier.
pub fn qualify_name(name: &str, provider: &str) -> String {
    if name.contains('@') {
        name.to_owned()
    } else {
        format!("{name}@{provider}")
    }
}

/// The provider part of a qualified name, if any.
pub fn provider_of(name: &str) -> Option<&str> {
    name.rsplit_once('@').map(|(_, p)| p)
}

/// The local part of a (possibly qualified) name.
pub fn local_of(name: &str) -> &str {
    name.rsplit_once('@').map_or(name, |(l, _)| l)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_name_gains_qualifier() {
        assert_eq!(qualify_name("svc", "file"), "svc@file");
    }

    #[test]
    fn qualified_name_untouched() {
        assert_eq!(qualify_name("svc@docker", "file"), "svc@docker");
    }

    #[test]
    fn provider_and_local_parts() {
        assert_eq!(provider_of("svc@file"), Some("file"));
        assert_eq!(provider_of("svc"), None);
        assert_eq!(local_of("svc@file"), "svc");
        assert_eq!(local_of("svc"), "svc");
    }
}
