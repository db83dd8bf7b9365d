//! mise adapter.
//!
//! Exposes the host's mise installation read-only so pinned toolchains
//! resolve inside the sandbox, and puts the shims directory on PATH. The
//! activation snippet itself is injected by the shell builder.

use super::{Binding, CheckResult, EnvVar, GlobalToolConfig, ToolAdapter};
use std::path::Path;

/// The mise tool adapter.
#[derive(Debug, Default)]
pub struct Mise {
    enabled: bool,
}

impl ToolAdapter for Mise {
    fn name(&self) -> &'static str {
        "mise"
    }

    fn description(&self) -> String {
        "mise toolchain manager (read-only host install)".to_string()
    }

    fn available(&self, _host_home: &Path) -> bool {
        self.enabled && which::which("mise").is_ok()
    }

    fn configure(&mut self, _global: &GlobalToolConfig, config: Option<&toml::Value>) {
        self.enabled = config
            .and_then(|c| c.get("enabled"))
            .and_then(|v| v.as_bool())
            .unwrap_or(true);
    }

    fn bindings(&self, host_home: &Path, _sandbox_home: &Path) -> Vec<Binding> {
        vec![
            Binding::ro(host_home.join(".local").join("share").join("mise")),
            Binding::ro(host_home.join(".config").join("mise")),
            Binding::ro(host_home.join(".local").join("bin")),
        ]
    }

    fn environment(&self, host_home: &Path, _sandbox_home: &Path) -> Vec<EnvVar> {
        let shims = host_home
            .join(".local")
            .join("share")
            .join("mise")
            .join("shims");
        vec![EnvVar::literal(
            "PATH",
            format!(
                "{}:{}/.local/bin:/usr/local/bin:/usr/bin:/bin",
                shims.display(),
                host_home.display()
            ),
        )]
    }

    fn check(&self, host_home: &Path) -> CheckResult {
        let mut result = CheckResult {
            binary_name: "mise".to_string(),
            install_hint: "curl https://mise.run | sh".to_string(),
            ..Default::default()
        };

        match which::which("mise") {
            Ok(path) => {
                result.binary_path = Some(path);
                result.available = self.enabled;
            }
            Err(_) => {
                result.issues.push("mise binary not found in PATH".to_string());
            }
        }

        let data_dir = host_home.join(".local").join("share").join("mise");
        if data_dir.exists() {
            result.config_paths.push(data_dir);
        }

        result
    }
}
