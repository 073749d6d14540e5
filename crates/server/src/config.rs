//! Static process configuration, loaded once from a TOML file.
//!
//! Static configuration covers what cannot change at runtime: entry point
//! bindings, pipeline timings, the internal API surface. Everything
//! routable lives in the dynamic configuration delivered by providers.

use std::collections::BTreeMap;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ServerError;

/// Top-level configuration for the Fluxgate server.
///
/// # Example
///
/// ```toml
/// [entry_points.web]
/// address = "0.0.0.0:80"
///
/// [entry_points.db]
/// address = "0.0.0.0:5432"
/// protocol = "tcp"
///
/// [pipeline]
/// throttle_interval = 2
/// drain_grace = 10
/// ```
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Entry points keyed by name.
    pub entry_points: BTreeMap<String, EntryPointConfig>,
    /// Configuration pipeline timings.
    pub pipeline: PipelineConfig,
    /// Internal API settings.
    pub api: ApiConfig,
    /// Access log settings.
    pub access_log: AccessLogConfig,
}

/// One bound L4 address plus protocol.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct EntryPointConfig {
    /// Bind address, `host:port`.
    pub address: String,
    /// `http`, `tcp` or `udp`.
    pub protocol: Protocol,
    /// Idle timeout in seconds for TCP connections and UDP sessions.
    pub idle_timeout: u64,
}

impl Default for EntryPointConfig {
    fn default() -> Self {
        Self {
            address: "0.0.0.0:80".to_owned(),
            protocol: Protocol::Http,
            idle_timeout: 180,
        }
    }
}

/// Entry point protocol.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    #[default]
    Http,
    Tcp,
    Udp,
}

/// Timings of the snapshot pipeline.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Minimum seconds between snapshot publications.
    pub throttle_interval: u64,
    /// Seconds granted to in-flight requests on a superseded runtime.
    pub drain_grace: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            throttle_interval: 2,
            drain_grace: 10,
        }
    }
}

impl PipelineConfig {
    pub fn throttle(&self) -> Duration {
        Duration::from_secs(self.throttle_interval)
    }

    pub fn grace(&self) -> Duration {
        Duration::from_secs(self.drain_grace)
    }
}

/// Internal API configuration.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    /// Serve `/api/*` and `/ping`.
    pub enabled: bool,
    /// Entry point carrying the internal API.
    pub entry_point: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            entry_point: "internal".to_owned(),
        }
    }
}

/// Access log configuration.
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct AccessLogConfig {
    /// Log file path; empty disables the access log.
    pub file_path: String,
}

impl ServerConfig {
    /// Load from `path`, or defaults when the file does not exist.
    pub fn load(path: &str) -> Result<Self, ServerError> {
        if !Path::new(path).exists() {
            return Ok(Self::default());
        }
        let contents = std::fs::read_to_string(path).map_err(|source| ServerError::ConfigRead {
            path: path.to_owned(),
            source,
        })?;
        toml::from_str(&contents).map_err(|source| ServerError::ConfigParse {
            path: path.to_owned(),
            source,
        })
    }

    /// Names of entry points with the given protocol.
    pub fn entry_point_names(&self, protocol: Protocol) -> Vec<String> {
        self.entry_points
            .iter()
            .filter(|(_, ep)| ep.protocol == protocol)
            .map(|(name, _)| name.clone())
            .collect()
    }

    /// The default internal entry point, added when the API is enabled and
    /// the configuration does not define one.
    pub fn ensure_internal_entry_point(&mut self) {
        if self.api.enabled && !self.entry_points.contains_key(&self.api.entry_point) {
            self.entry_points.insert(
                self.api.entry_point.clone(),
                EntryPointConfig {
                    address: "127.0.0.1:8080".to_owned(),
                    protocol: Protocol::Http,
                    idle_timeout: 180,
                },
            );
        }
    }
}
