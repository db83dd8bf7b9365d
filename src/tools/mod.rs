//! Tool adapters and their registry.
//!
//! Adapters declare what a named developer tool needs inside the sandbox:
//! bind mounts, environment variables, a shell-init snippet, and an
//! optional setup hook that materializes sanitized configuration into the
//! sandbox home. Contributions are pure functions of their inputs; the
//! composer decides what actually gets mounted (optional bindings with a
//! missing source are silently dropped, and the block list is applied on
//! top of everything adapters contribute).

mod git;
mod mise;

pub use git::{Git, GitMode};
pub use mise::Mise;

use crate::sandbox::shell::Shell;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;

/// A bind mount contributed by an adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Binding {
    /// Source path on the host.
    pub src: PathBuf,
    /// Destination inside the sandbox.
    pub dest: PathBuf,
    /// Mounted read-only.
    pub read_only: bool,
    /// Silently dropped when the source does not exist.
    pub optional: bool,
}

impl Binding {
    /// Read-only optional binding of the same path.
    pub fn ro(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            src: path.clone(),
            dest: path,
            read_only: true,
            optional: true,
        }
    }

    /// Read-write optional binding of the same path.
    pub fn rw(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        Self {
            src: path.clone(),
            dest: path,
            read_only: false,
            optional: true,
        }
    }
}

/// An environment variable contributed by an adapter.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvVar {
    /// Variable name.
    pub name: String,
    /// Where the value comes from.
    pub value: EnvValue,
}

/// Source of an adapter environment variable value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EnvValue {
    /// A fixed value.
    Literal(String),
    /// Read from the host environment at compose time; dropped if unset.
    FromHost,
}

impl EnvVar {
    /// A literal variable.
    pub fn literal(name: &str, value: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            value: EnvValue::Literal(value.into()),
        }
    }

    /// A variable imported from the host environment.
    pub fn from_host(name: &str) -> Self {
        Self {
            name: name.to_string(),
            value: EnvValue::FromHost,
        }
    }
}

/// Result of an adapter's host diagnostic check.
#[derive(Debug, Clone, Default)]
pub struct CheckResult {
    /// Binary the adapter wraps.
    pub binary_name: String,
    /// Resolved path of the binary, if found.
    pub binary_path: Option<PathBuf>,
    /// Whether the adapter is usable on this host.
    pub available: bool,
    /// Config paths that were found.
    pub config_paths: Vec<PathBuf>,
    /// Problems that keep the adapter from working.
    pub issues: Vec<String>,
    /// How to install the missing binary.
    pub install_hint: String,
}

/// Context shared with adapters at configuration time.
#[derive(Debug, Clone, Default)]
pub struct GlobalToolConfig {
    /// The project directory being sandboxed.
    pub project_dir: PathBuf,
    /// Whether proxy mode is on.
    pub proxy_enabled: bool,
}

/// Errors from adapter setup hooks.
#[derive(Debug, Error)]
pub enum ToolError {
    /// Setup failed to materialize a config file.
    #[error("tool '{tool}' setup failed: {source}")]
    Setup {
        /// The adapter name.
        tool: &'static str,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },
}

/// A named tool adapter.
pub trait ToolAdapter: Send {
    /// Registry name.
    fn name(&self) -> &'static str;

    /// Human-readable description of the current configuration.
    fn description(&self) -> String;

    /// Whether the tool is present/usable on this host.
    fn available(&self, host_home: &Path) -> bool;

    /// Apply global context and per-tool configuration.
    fn configure(&mut self, global: &GlobalToolConfig, config: Option<&toml::Value>);

    /// Bind mounts this adapter contributes.
    fn bindings(&self, host_home: &Path, sandbox_home: &Path) -> Vec<Binding>;

    /// Environment variables this adapter contributes.
    fn environment(&self, host_home: &Path, sandbox_home: &Path) -> Vec<EnvVar>;

    /// Shell fragment run before the user command, if any.
    fn shell_init(&self, shell: Shell) -> Option<String> {
        let _ = shell;
        None
    }

    /// Materialize sandbox-side configuration (e.g. a sanitized config
    /// file in the sandbox home). Runs before composition.
    fn setup(&self, host_home: &Path, sandbox_home: &Path) -> Result<(), ToolError> {
        let _ = (host_home, sandbox_home);
        Ok(())
    }

    /// Diagnostic check for the doctor-style tooling.
    fn check(&self, host_home: &Path) -> CheckResult;
}

/// Ordered collection of the built-in adapters.
pub struct ToolRegistry {
    adapters: Vec<Box<dyn ToolAdapter>>,
}

impl ToolRegistry {
    /// Registry with every built-in adapter.
    pub fn builtin() -> Self {
        Self {
            adapters: vec![Box::new(Git::default()), Box::new(Mise::default())],
        }
    }

    /// Configure every adapter from the `[tools.<name>]` config sections.
    pub fn configure(
        &mut self,
        global: &GlobalToolConfig,
        tool_configs: &HashMap<String, toml::Value>,
    ) {
        for adapter in &mut self.adapters {
            let config = tool_configs.get(adapter.name());
            adapter.configure(global, config);
        }
    }

    /// Adapters that are usable on this host.
    pub fn active(&self, host_home: &Path) -> Vec<&dyn ToolAdapter> {
        self.adapters
            .iter()
            .map(|a| a.as_ref())
            .filter(|a| a.available(host_home))
            .collect()
    }

    /// Look up an adapter by name.
    pub fn get(&self, name: &str) -> Option<&dyn ToolAdapter> {
        self.adapters
            .iter()
            .map(|a| a.as_ref())
            .find(|a| a.name() == name)
    }

    /// All adapter names, in registry order.
    pub fn names(&self) -> Vec<&'static str> {
        self.adapters.iter().map(|a| a.name()).collect()
    }
}

/// Copy a config file to `dest`, appending `suffix`. Creates the
/// destination directory. A missing source is not an error.
pub fn copy_config_with_suffix(
    src: &Path,
    dest: &Path,
    suffix: &str,
) -> std::io::Result<()> {
    if !src.exists() {
        return Ok(());
    }
    if let Some(parent) = dest.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut content = std::fs::read_to_string(src)?;
    content.push_str(suffix);
    std::fs::write(dest, content)
}
