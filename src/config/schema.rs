//! Configuration schema.
//!
//! One TOML document with sections `[proxy]`, `[proxy.credentials.<label>]`,
//! `[filter]`, `[[filter.rules]]`, and `[tools.<name>]`. Tool sections are
//! passed through to the adapters untyped; each adapter interprets its own
//! table.

use crate::proxy::credentials::CredentialRecipe;
use crate::proxy::filter::FilterConfig;
use crate::proxy::rotating;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// Default proxy port. The server walks forward from here on collisions.
pub const DEFAULT_PROXY_PORT: u16 = 18080;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    /// Proxy settings.
    #[serde(default)]
    pub proxy: ProxySection,

    /// Request filter settings.
    #[serde(default)]
    pub filter: FilterConfig,

    /// Per-tool configuration, handed to adapters untyped.
    #[serde(default)]
    pub tools: HashMap<String, toml::Value>,
}

impl Config {
    /// Merge another config into this one.
    ///
    /// Scalars are overridden, lists and maps are merged. The filter
    /// section is replaced wholesale when the other config defines one:
    /// rule order is load-bearing, so partial merges of rule lists would
    /// change semantics silently.
    pub fn merge(&mut self, other: Config) {
        self.proxy.merge(other.proxy);
        if other.filter.default_action.is_some() || !other.filter.rules.is_empty() {
            self.filter = other.filter;
        }
        self.tools.extend(other.tools);
    }

    /// Validate the merged configuration.
    pub fn validate(&self) -> Result<(), super::error::ConfigError> {
        self.filter.validate()?;
        if self.proxy.log_max_files == 0 {
            return Err(super::error::ConfigError::InvalidValue {
                field: "proxy.log_max_files".to_string(),
                message: "must be at least 1".to_string(),
            });
        }
        Ok(())
    }
}

/// `[proxy]` section.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ProxySection {
    /// Whether proxy mode is on.
    #[serde(default)]
    pub enabled: bool,

    /// Requested listen port on loopback.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Rotation threshold for request logs, in bytes.
    #[serde(default = "default_log_max_size")]
    pub log_max_size: u64,

    /// Retention count for request logs.
    #[serde(default = "default_log_max_files")]
    pub log_max_files: usize,

    /// Header names whose values are redacted in request logs.
    #[serde(default)]
    pub redact_headers: Vec<String>,

    /// Extra PEM root files trusted for upstream verification.
    #[serde(default)]
    pub upstream_ca_files: Vec<PathBuf>,

    /// Credential recipes by label.
    #[serde(default)]
    pub credentials: HashMap<String, CredentialRecipe>,
}

fn default_port() -> u16 {
    DEFAULT_PROXY_PORT
}

fn default_log_max_size() -> u64 {
    rotating::DEFAULT_MAX_SIZE
}

fn default_log_max_files() -> usize {
    rotating::DEFAULT_MAX_FILES
}

impl Default for ProxySection {
    fn default() -> Self {
        Self {
            enabled: false,
            port: default_port(),
            log_max_size: default_log_max_size(),
            log_max_files: default_log_max_files(),
            redact_headers: Vec::new(),
            upstream_ca_files: Vec::new(),
            credentials: HashMap::new(),
        }
    }
}

impl ProxySection {
    fn merge(&mut self, other: ProxySection) {
        // Scalars override when they differ from the default.
        if other.enabled {
            self.enabled = true;
        }
        if other.port != default_port() {
            self.port = other.port;
        }
        if other.log_max_size != default_log_max_size() {
            self.log_max_size = other.log_max_size;
        }
        if other.log_max_files != default_log_max_files() {
            self.log_max_files = other.log_max_files;
        }

        // Lists and maps merge.
        self.redact_headers.extend(other.redact_headers);
        self.upstream_ca_files.extend(other.upstream_ca_files);
        self.credentials.extend(other.credentials);
    }
}
