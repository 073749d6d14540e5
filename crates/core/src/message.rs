use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::config::DynamicConfig;

/// Stable short name of a configuration provider (`file`, `docker`, `kv`).
///
/// Unique per running process; doubles as the qualifier suffix applied to
/// every entity name the provider emits.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProviderId(String);

impl ProviderId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Whether this is the reserved internal provider.
    pub fn is_internal(&self) -> bool {
        self.0 == crate::name::INTERNAL_PROVIDER
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ProviderId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

/// One provider's complete current view of its configuration.
///
/// Always a full tree, never a delta: the aggregator replaces the provider's
/// previous payload wholesale.
#[derive(Debug, Clone, PartialEq)]
pub struct ConfigMessage {
    /// The emitting provider.
    pub provider: ProviderId,
    /// The provider's full configuration tree.
    pub config: DynamicConfig,
}

impl ConfigMessage {
    pub fn new(provider: impl Into<ProviderId>, config: DynamicConfig) -> Self {
        Self {
            provider: provider.into(),
            config,
        }
    }
}

/// The aggregator's merged view across all providers at one revision.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Snapshot {
    /// Last payload received per provider.
    pub configs: BTreeMap<ProviderId, DynamicConfig>,
    /// Monotonically increasing publication counter.
    pub revision: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_id_display_and_internal() {
        let id = ProviderId::new("file");
        assert_eq!(id.to_string(), "file");
        assert!(!id.is_internal());
        assert!(ProviderId::new("internal").is_internal());
    }
}
