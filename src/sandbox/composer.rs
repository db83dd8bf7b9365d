//! Sandbox composer.
//!
//! Translates the declarative inputs (identity, tool adapters, proxy
//! endpoint) into the final bwrap argument vector and in-sandbox shell
//! command, then drives execution. The composer exclusively owns the
//! argument vector; adapters only contribute declarative pieces.
//!
//! Ordering matters in exactly one place: the credential block list is
//! overlaid *after* all adapter contributions, so a misconfigured adapter
//! cannot re-expose a blocked path.

use super::builder::BwrapBuilder;
use super::error::SandboxError;
use super::identity::{SandboxIdentity, SandboxPaths};
use super::shell::{build_shell_command, Shell};
use crate::tools::{EnvValue, ToolAdapter};
use std::collections::BTreeMap;
use std::convert::Infallible;
use std::ffi::{CString, OsString};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Where the CA certificate is placed inside the sandbox. `/etc/ssl` is
/// read-only bound from the host, so the copy goes into the tmpfs /tmp.
pub const SANDBOX_CA_MOUNT_PATH: &str = "/tmp/devsandbox-ca.crt";

/// Home-relative directories shadowed with an empty tmpfs, always, after
/// every adapter contribution.
pub const BLOCKED_HOME_DIRS: &[&str] = &[
    ".ssh",
    ".aws",
    ".gnupg",
    ".config/gh",
    ".config/gcloud",
    ".azure",
    ".kube",
];

/// Project-relative files masked with /dev/null when they exist.
pub const BLOCKED_PROJECT_FILES: &[&str] = &[".env", ".envrc"];

/// Proxy endpoint injected into the sandbox environment.
#[derive(Debug, Clone)]
pub struct ProxyEndpoint {
    /// Gateway IP as seen from inside the sandbox.
    pub gateway_ip: String,
    /// Bound proxy port on the host loopback.
    pub port: u16,
    /// Host path of the CA certificate to expose.
    pub ca_cert_path: PathBuf,
}

impl ProxyEndpoint {
    /// The proxy URL for `HTTP_PROXY`/`HTTPS_PROXY`.
    pub fn url(&self) -> String {
        format!("http://{}:{}", self.gateway_ip, self.port)
    }
}

/// A fully assembled sandbox invocation.
#[derive(Debug)]
pub struct Composition {
    /// Arguments for the sandbox primitive (without argv0 or `--`).
    pub bwrap_args: Vec<OsString>,
    /// Command executed inside the sandbox.
    pub shell_cmd: Vec<String>,
}

/// Assembles bwrap invocations for one sandbox.
pub struct Composer {
    /// Resolved project identity.
    pub identity: SandboxIdentity,
    /// Sandbox directory layout.
    pub paths: SandboxPaths,
    /// The real host home directory.
    pub host_home: PathBuf,
    /// Detected shell family.
    pub shell: Shell,
    /// Path to the shell binary.
    pub shell_path: PathBuf,
    /// Proxy endpoint, when proxy mode is on.
    pub proxy: Option<ProxyEndpoint>,
}

impl Composer {
    /// Build the final argument vector and shell command.
    ///
    /// Adapter setup hooks must have run already; this only reads their
    /// contributions.
    pub fn compose(
        &self,
        adapters: &[&dyn ToolAdapter],
        command: &[String],
    ) -> Result<Composition, SandboxError> {
        let home = self.host_home.as_path();
        let mut b = BwrapBuilder::new()
            .clear_env()
            .unshare_user()
            .unshare_pid()
            .die_with_parent()
            .uid_gid(nix::unistd::getuid().as_raw(), nix::unistd::getgid().as_raw())
            .proc(Path::new("/proc"))
            .dev(Path::new("/dev"))
            .tmpfs(Path::new("/tmp"))
            .ro_bind(Path::new("/usr"), Path::new("/usr"))
            .ro_bind(Path::new("/etc"), Path::new("/etc"));

        // Merged-usr systems have /lib and friends as symlinks; recreate
        // the symlink rather than binding through it.
        for dir in ["/lib", "/lib64", "/bin", "/sbin"] {
            let path = Path::new(dir);
            b = match std::fs::read_link(path) {
                Ok(target) => b.symlink(&target.to_string_lossy(), path),
                Err(_) => b.ro_bind_try(path, path),
            };
        }

        // Project tree writable at its real path, sandbox home shadowing
        // the real home.
        b = b
            .bind(&self.identity.project_dir, &self.identity.project_dir)
            .bind(&self.paths.home, home)
            .chdir(&self.identity.project_dir);

        // Tool contributions.
        let mut env: BTreeMap<String, String> = BTreeMap::new();
        let mut init_snippets: Vec<String> = Vec::new();

        for adapter in adapters {
            for binding in adapter.bindings(home, &self.paths.home) {
                if !binding.src.exists() {
                    if binding.optional {
                        debug!(
                            "Dropping optional binding {:?} (missing source)",
                            binding.src
                        );
                        continue;
                    }
                    return Err(SandboxError::BindingSourceMissing { path: binding.src });
                }
                b = if binding.read_only {
                    b.ro_bind(&binding.src, &binding.dest)
                } else {
                    b.bind(&binding.src, &binding.dest)
                };
            }

            for var in adapter.environment(home, &self.paths.home) {
                match var.value {
                    EnvValue::Literal(value) => {
                        env.insert(var.name, value);
                    }
                    EnvValue::FromHost => {
                        if let Ok(value) = std::env::var(&var.name) {
                            env.insert(var.name, value);
                        }
                    }
                }
            }

            if let Some(snippet) = adapter.shell_init(self.shell) {
                init_snippets.push(snippet);
            }
        }

        // Credential block list, on top of whatever adapters contributed.
        for blocked in BLOCKED_HOME_DIRS {
            b = b.tmpfs(&home.join(blocked));
        }
        for blocked in BLOCKED_PROJECT_FILES {
            let path = self.identity.project_dir.join(blocked);
            if path.exists() {
                b = b.ro_bind(Path::new("/dev/null"), &path);
            }
        }

        // Canonical sandbox environment.
        env.insert("DEVSANDBOX".into(), "1".into());
        env.insert(
            "DEVSANDBOX_PROJECT".into(),
            self.identity.project_name.clone(),
        );
        env.insert("HOME".into(), home.to_string_lossy().into_owned());
        env.insert(
            "XDG_CONFIG_HOME".into(),
            home.join(".config").to_string_lossy().into_owned(),
        );
        env.insert(
            "XDG_DATA_HOME".into(),
            home.join(".local/share").to_string_lossy().into_owned(),
        );
        env.insert(
            "XDG_STATE_HOME".into(),
            home.join(".local/state").to_string_lossy().into_owned(),
        );
        let runtime_dir = std::env::var("XDG_RUNTIME_DIR")
            .unwrap_or_else(|_| format!("/run/user/{}", nix::unistd::getuid().as_raw()));
        env.insert("XDG_RUNTIME_DIR".into(), runtime_dir);
        env.entry("PATH".into()).or_insert_with(|| {
            format!(
                "{}/.local/bin:/usr/local/bin:/usr/bin:/bin",
                home.display()
            )
        });
        for passthrough in ["TERM", "COLORTERM", "LANG"] {
            if let Ok(value) = std::env::var(passthrough) {
                env.insert(passthrough.into(), value);
            }
        }

        if let Some(proxy) = &self.proxy {
            b = b.ro_bind(&proxy.ca_cert_path, Path::new(SANDBOX_CA_MOUNT_PATH));

            let url = proxy.url();
            env.insert("HTTP_PROXY".into(), url.clone());
            env.insert("HTTPS_PROXY".into(), url.clone());
            env.insert("http_proxy".into(), url.clone());
            env.insert("https_proxy".into(), url);
            env.insert("NO_PROXY".into(), "localhost,127.0.0.1".into());
            env.insert("NODE_EXTRA_CA_CERTS".into(), SANDBOX_CA_MOUNT_PATH.into());
            env.insert("REQUESTS_CA_BUNDLE".into(), SANDBOX_CA_MOUNT_PATH.into());
            env.insert("SSL_CERT_FILE".into(), SANDBOX_CA_MOUNT_PATH.into());
            env.insert("DEVSANDBOX_PROXY".into(), "1".into());
        }

        for (key, value) in &env {
            b = b.setenv(key, value);
        }

        let shell_cmd = build_shell_command(
            self.shell,
            &self.shell_path,
            &self.identity.project_name,
            &init_snippets,
            command,
        );

        Ok(Composition {
            bwrap_args: b.build(),
            shell_cmd,
        })
    }
}

/// Check that the sandbox primitive is installed.
pub fn check_bwrap_installed() -> Result<(), SandboxError> {
    which::which("bwrap")
        .map(|_| ())
        .map_err(|_| SandboxError::BwrapMissing)
}

/// Replace the current process with the bwrap invocation. Only returns on
/// failure. Used in non-proxy mode; proxy mode goes through the network
/// driver so the proxy keeps running in this process.
pub fn exec_bwrap(composition: &Composition) -> Result<Infallible, SandboxError> {
    check_bwrap_installed()?;

    info!("Handing off to bwrap");

    let mut argv: Vec<CString> = Vec::with_capacity(composition.bwrap_args.len() + composition.shell_cmd.len() + 2);
    argv.push(CString::new("bwrap").expect("static"));
    for arg in &composition.bwrap_args {
        argv.push(
            CString::new(arg.as_encoded_bytes())
                .map_err(|e| SandboxError::Exec(std::io::Error::other(e)))?,
        );
    }
    argv.push(CString::new("--").expect("static"));
    for arg in &composition.shell_cmd {
        argv.push(
            CString::new(arg.as_bytes())
                .map_err(|e| SandboxError::Exec(std::io::Error::other(e)))?,
        );
    }

    nix::unistd::execvp(&argv[0], &argv)
        .map_err(|errno| SandboxError::Exec(std::io::Error::from_raw_os_error(errno as i32)))
}
