//! Git adapter.
//!
//! Three modes:
//!
//! - **readonly** (default): the sandbox sees a sanitized gitconfig
//!   carrying only `[user]` name/email. Credential helpers, signing keys,
//!   editors, and aliases never cross the boundary. The project's `.git`
//!   is mounted read-only, so status and diff work but commits and pushes
//!   do not.
//! - **readwrite**: the real `.gitconfig` is writable, credentials and key
//!   material are offered read-only, and `SSH_AUTH_SOCK` / `GPG_TTY` are
//!   imported so agent-based signing and pushing work.
//! - **disabled**: git gets nothing.

use super::{Binding, CheckResult, EnvVar, GlobalToolConfig, ToolAdapter, ToolError};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::debug;

/// File name of the sanitized config inside the sandbox home.
pub const SAFE_GITCONFIG_NAME: &str = ".gitconfig.safe";

/// Access mode for the git adapter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum GitMode {
    /// Sanitized config, read-only repository access.
    #[default]
    ReadOnly,
    /// Full access including credentials and signing.
    ReadWrite,
    /// No git integration.
    Disabled,
}

impl GitMode {
    fn parse(value: &str) -> Self {
        match value.to_lowercase().as_str() {
            "readwrite" | "read-write" | "rw" => GitMode::ReadWrite,
            "disabled" | "none" | "off" => GitMode::Disabled,
            _ => GitMode::ReadOnly,
        }
    }
}

/// The git tool adapter.
#[derive(Debug, Default)]
pub struct Git {
    mode: GitMode,
    project_dir: PathBuf,
}

impl ToolAdapter for Git {
    fn name(&self) -> &'static str {
        "git"
    }

    fn description(&self) -> String {
        match self.mode {
            GitMode::ReadOnly => "Git with sanitized config (read-only repository)".to_string(),
            GitMode::ReadWrite => "Git with full access (credentials and signing)".to_string(),
            GitMode::Disabled => "Git integration disabled".to_string(),
        }
    }

    fn available(&self, _host_home: &Path) -> bool {
        self.mode != GitMode::Disabled && which::which("git").is_ok()
    }

    fn configure(&mut self, global: &GlobalToolConfig, config: Option<&toml::Value>) {
        self.project_dir = global.project_dir.clone();
        self.mode = config
            .and_then(|c| c.get("mode"))
            .and_then(|m| m.as_str())
            .map(GitMode::parse)
            .unwrap_or_default();
    }

    fn bindings(&self, host_home: &Path, sandbox_home: &Path) -> Vec<Binding> {
        match self.mode {
            GitMode::Disabled => Vec::new(),
            GitMode::ReadOnly => {
                let mut bindings = vec![Binding {
                    src: sandbox_home.join(SAFE_GITCONFIG_NAME),
                    dest: host_home.join(".gitconfig"),
                    read_only: true,
                    optional: true,
                }];

                let git_dir = self.project_dir.join(".git");
                if git_dir.exists() {
                    bindings.push(Binding {
                        src: git_dir.clone(),
                        dest: git_dir,
                        read_only: true,
                        optional: false,
                    });
                }
                bindings
            }
            GitMode::ReadWrite => vec![
                Binding::rw(host_home.join(".gitconfig")),
                Binding::ro(host_home.join(".git-credentials")),
                Binding::ro(host_home.join(".ssh")),
                Binding::ro(host_home.join(".gnupg")),
            ],
        }
    }

    fn environment(&self, _host_home: &Path, _sandbox_home: &Path) -> Vec<EnvVar> {
        match self.mode {
            GitMode::ReadWrite => vec![
                EnvVar::from_host("SSH_AUTH_SOCK"),
                EnvVar::from_host("GPG_TTY"),
            ],
            _ => Vec::new(),
        }
    }

    fn setup(&self, host_home: &Path, sandbox_home: &Path) -> Result<(), ToolError> {
        if self.mode != GitMode::ReadOnly {
            return Ok(());
        }

        let source = host_home.join(".gitconfig");
        if !source.exists() {
            return Ok(());
        }

        let (name, email) = parse_gitconfig(&source);
        let mut safe = String::from("[user]\n");
        if let Some(name) = name {
            safe.push_str(&format!("\tname = {name}\n"));
        }
        if let Some(email) = email {
            safe.push_str(&format!("\temail = {email}\n"));
        }

        let dest = sandbox_home.join(SAFE_GITCONFIG_NAME);
        debug!("Materializing sanitized gitconfig at {:?}", dest);
        fs::write(&dest, safe).map_err(|source| ToolError::Setup {
            tool: "git",
            source,
        })
    }

    fn check(&self, host_home: &Path) -> CheckResult {
        let mut result = CheckResult {
            binary_name: "git".to_string(),
            install_hint: "sudo apt install git".to_string(),
            ..Default::default()
        };

        match which::which("git") {
            Ok(path) => {
                result.binary_path = Some(path);
                result.available = self.mode != GitMode::Disabled;
            }
            Err(_) => {
                result.issues.push("git binary not found in PATH".to_string());
            }
        }

        let gitconfig = host_home.join(".gitconfig");
        if gitconfig.exists() {
            result.config_paths.push(gitconfig);
        }

        result
    }
}

/// Extract `[user]` name and email from a gitconfig. Anything else in the
/// file is deliberately ignored.
fn parse_gitconfig(path: &Path) -> (Option<String>, Option<String>) {
    let Ok(content) = fs::read_to_string(path) else {
        return (None, None);
    };

    let mut in_user = false;
    let mut name = None;
    let mut email = None;

    for line in content.lines() {
        let line = line.trim();
        if line.starts_with('[') {
            in_user = line == "[user]";
            continue;
        }
        if !in_user {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            match key.trim() {
                "name" => name = Some(value.trim().to_string()),
                "email" => email = Some(value.trim().to_string()),
                _ => {}
            }
        }
    }

    (name, email)
}
