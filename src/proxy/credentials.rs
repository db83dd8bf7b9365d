//! Credential injection for known upstreams.
//!
//! Each configured label (e.g. `github`) names a set of host patterns, a
//! header recipe, and a host-side environment variable holding the secret.
//! When an outbound request targets a matching host, the formatted header
//! is attached. Secrets are loaded once at proxy startup, held in
//! [`Zeroizing`] buffers, and never written into the sandbox filesystem.
//!
//! Injection runs after request capture, so secrets never reach the
//! request log.

use super::error::ProxyError;
use hyper::header::{HeaderName, HeaderValue};
use hyper::HeaderMap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use tracing::{debug, warn};
use wildmatch::WildMatch;
use zeroize::Zeroizing;

/// Configuration for one credential label.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CredentialRecipe {
    /// Host patterns this label applies to (glob, matched case-insensitively).
    pub hosts: Vec<String>,
    /// Header to attach.
    #[serde(default = "default_header")]
    pub header: String,
    /// Header value template; `{}` is replaced with the secret.
    #[serde(default = "default_format")]
    pub format: String,
    /// Host environment variable holding the secret.
    pub from_env: String,
    /// Whether this label is active.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_header() -> String {
    "Authorization".to_string()
}

fn default_format() -> String {
    "Bearer {}".to_string()
}

fn default_true() -> bool {
    true
}

struct LoadedCredential {
    label: String,
    matchers: Vec<WildMatch>,
    header: HeaderName,
    value: Zeroizing<String>,
}

/// Attaches per-host credential headers to outbound requests.
pub struct CredentialInjector {
    entries: Vec<LoadedCredential>,
}

impl CredentialInjector {
    /// Load secrets for all enabled labels from the host environment.
    ///
    /// Labels whose environment variable is unset are skipped with a
    /// warning; a malformed header name or value is an error.
    pub fn load(recipes: &HashMap<String, CredentialRecipe>) -> Result<Self, ProxyError> {
        let mut entries = Vec::new();

        for (label, recipe) in recipes {
            if !recipe.enabled {
                continue;
            }

            let secret = match std::env::var(&recipe.from_env) {
                Ok(value) if !value.is_empty() => Zeroizing::new(value),
                _ => {
                    warn!(
                        "Credential '{}': ${} not set, skipping injection",
                        label, recipe.from_env
                    );
                    continue;
                }
            };

            let header =
                recipe
                    .header
                    .parse::<HeaderName>()
                    .map_err(|e| ProxyError::Credential {
                        label: label.clone(),
                        message: format!("invalid header name {:?}: {}", recipe.header, e),
                    })?;

            let value = Zeroizing::new(recipe.format.replace("{}", &secret));
            HeaderValue::from_str(&value).map_err(|e| ProxyError::Credential {
                label: label.clone(),
                message: format!("formatted value is not a valid header: {e}"),
            })?;

            debug!("Loaded credential '{}' for {:?}", label, recipe.hosts);
            entries.push(LoadedCredential {
                label: label.clone(),
                matchers: recipe
                    .hosts
                    .iter()
                    .map(|h| WildMatch::new(&h.to_lowercase()))
                    .collect(),
                header,
                value,
            });
        }

        Ok(Self { entries })
    }

    /// Injector that never attaches anything.
    pub fn empty() -> Self {
        Self { entries: Vec::new() }
    }

    /// Attach matching credential headers for `host` to `headers`.
    /// Existing values for the same header are replaced.
    pub fn apply(&self, host: &str, headers: &mut HeaderMap) {
        let host = host.to_lowercase();
        for entry in &self.entries {
            if entry.matchers.iter().any(|m| m.matches(&host)) {
                debug!("Injecting credential '{}' for {}", entry.label, host);
                // Validated at load time.
                if let Ok(value) = HeaderValue::from_str(&entry.value) {
                    headers.insert(entry.header.clone(), value);
                }
            }
        }
    }

    /// Number of loaded credentials.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no credentials are loaded.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
