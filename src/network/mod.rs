//! User-mode network isolation for proxy mode.
//!
//! With the proxy on, the sandbox runs inside a pasta network namespace
//! whose only reachable address is a fabricated gateway mapped to the
//! host's loopback. A firewall fragment installed before the sandbox
//! primitive rejects everything else, so the in-process proxy is the sole
//! path out. IPv6 egress has no gateway and is blocked with the rest.

use std::ffi::OsString;
use std::process::{Command, ExitStatus};
use thiserror::Error;
use tracing::{debug, info};

/// Gateway IP inside the namespace, mapped to host loopback by pasta.
pub const GATEWAY_IP: &str = "10.0.2.2";

/// Firewall fragment run inside the namespace before the sandbox
/// primitive: accept the gateway, reject all other egress.
const FIREWALL_SCRIPT: &str = "iptables -I OUTPUT -d 10.0.2.2 -j ACCEPT 2>/dev/null; \
     iptables -A OUTPUT -j REJECT 2>/dev/null; exec \"$@\"";

/// Errors from the network driver.
#[derive(Debug, Error)]
pub enum NetworkError {
    /// pasta is not installed on the host.
    #[error("pasta is not available (install the passt package for proxy mode)")]
    PastaMissing,

    /// bwrap is not installed on the host.
    #[error("bubblewrap (bwrap) is not installed\nInstall with: sudo apt install bubblewrap")]
    BwrapMissing,

    /// Running the wrapped sandbox failed.
    #[error("failed to run sandbox under pasta: {0}")]
    Run(#[source] std::io::Error),
}

/// A user-mode network provider.
///
/// The only implementation is [`Pasta`]; the trait keeps the composer
/// independent of the helper and gives tests a seam.
pub trait NetworkProvider {
    /// Provider name.
    fn name(&self) -> &'static str;

    /// Whether the provider is installed and usable.
    fn available(&self) -> bool;

    /// Gateway IP reachable from inside the namespace.
    fn gateway_ip(&self) -> &'static str;

    /// Whether the provider isolates the network namespace.
    fn network_isolated(&self) -> bool;
}

/// The pasta (passt) user-mode networking provider.
#[derive(Debug, Default)]
pub struct Pasta;

impl Pasta {
    /// New provider handle.
    pub fn new() -> Self {
        Self
    }

    /// Run bwrap inside a pasta namespace and wait for completion.
    ///
    /// The calling process stays alive (the proxy runs in it), so this
    /// spawns and waits instead of exec-replacing:
    ///
    /// ```text
    /// pasta --config-net --map-host-loopback 10.0.2.2 -f -- \
    ///   sh -c '<firewall>' _ bwrap <args> -- <shell command>
    /// ```
    pub fn run(
        &self,
        bwrap_args: &[OsString],
        shell_cmd: &[String],
    ) -> Result<ExitStatus, NetworkError> {
        let pasta = which::which("pasta").map_err(|_| NetworkError::PastaMissing)?;
        let bwrap = which::which("bwrap").map_err(|_| NetworkError::BwrapMissing)?;

        let mut args: Vec<OsString> = vec![
            "--config-net".into(),
            "--map-host-loopback".into(),
            GATEWAY_IP.into(),
            "-f".into(),
            "--".into(),
            "sh".into(),
            "-c".into(),
            FIREWALL_SCRIPT.into(),
            "_".into(),
            bwrap.into_os_string(),
        ];
        args.extend(bwrap_args.iter().cloned());
        args.push("--".into());
        args.extend(shell_cmd.iter().map(OsString::from));

        debug!("pasta argv: {:?}", args);
        info!("Starting sandbox inside pasta namespace (gateway {})", GATEWAY_IP);

        Command::new(pasta)
            .args(&args)
            .status()
            .map_err(NetworkError::Run)
    }
}

impl NetworkProvider for Pasta {
    fn name(&self) -> &'static str {
        "pasta"
    }

    fn available(&self) -> bool {
        which::which("pasta").is_ok()
    }

    fn gateway_ip(&self) -> &'static str {
        GATEWAY_IP
    }

    fn network_isolated(&self) -> bool {
        true
    }
}

/// Select the provider for proxy mode. Proxy mode requires pasta; there
/// is no degraded fallback.
pub fn select_provider() -> Result<Pasta, NetworkError> {
    let pasta = Pasta::new();
    if pasta.available() {
        Ok(pasta)
    } else {
        Err(NetworkError::PastaMissing)
    }
}
