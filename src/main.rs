//! devsandbox entry point.
//!
//! Startup flow: resolve the project identity, create the sandbox tree,
//! acquire the session lock, optionally start the proxy, compose the
//! bwrap invocation from the active tool adapters, then hand off.
//!
//! In non-proxy mode the process exec-replaces itself with bwrap. In
//! proxy mode it stays alive (the proxy runs here) and the sandbox is
//! wrapped in the pasta network driver instead; the inner exit code is
//! propagated.

use anyhow::{Context, Result};
use clap::Parser;
use devsandbox::{
    cli::Cli,
    config::{Config, ConfigError, ConfigLoader},
    network::{self, NetworkError, NetworkProvider},
    proxy::{CaError, ProxyConfig, ProxyError, ProxyServer},
    sandbox::{
        self, composer::ProxyEndpoint, Composer, SandboxError, SandboxIdentity, SandboxMetadata,
        SandboxPaths,
    },
    tools::{GlobalToolConfig, ToolAdapter, ToolRegistry},
};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info};

/// Exit code for configuration errors.
const EXIT_CONFIG_INVALID: i32 = 2;
/// Exit code when bwrap is not installed.
const EXIT_BWRAP_MISSING: i32 = 21;
/// Exit code when pasta is not installed.
const EXIT_PASTA_MISSING: i32 = 22;
/// Exit code when no proxy port could be bound.
const EXIT_PORT_EXHAUSTED: i32 = 23;
/// Exit code when the CA could not be loaded or created.
const EXIT_CA_FAILED: i32 = 24;

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("devsandbox: {err:#}");
            std::process::exit(exit_code_for(&err));
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();

    let home_dir = dirs::home_dir().ok_or(SandboxError::NoHomeDirectory)?;
    let project_dir = std::env::current_dir().context("failed to get current directory")?;

    let base_dir = SandboxPaths::default_base_dir(&home_dir);
    let identity = SandboxIdentity::resolve(&base_dir, &project_dir);
    let paths = SandboxPaths::new(&base_dir, &identity.project_name);
    paths.ensure_dirs()?;

    init_tracing(cli.verbose, &paths.internal_logs)?;
    debug!("Sandbox identity: {:?}", identity);

    SandboxMetadata::create_or_touch(&paths.root, &identity.project_dir, &identity.project_name);

    let loader = ConfigLoader {
        extra_config: cli.config.clone(),
    };
    let config = loader
        .load(&home_dir, &project_dir)
        .context("failed to load configuration")?;

    let proxy_enabled = cli.proxy || config.proxy.enabled;

    let mut registry = ToolRegistry::builtin();
    registry.configure(
        &GlobalToolConfig {
            project_dir: identity.project_dir.clone(),
            proxy_enabled,
        },
        &config.tools,
    );
    let adapters = registry.active(&home_dir);

    if cli.info {
        print_info(&identity, &paths, proxy_enabled, &adapters);
        return Ok(0);
    }

    sandbox::check_bwrap_installed()?;

    for adapter in &adapters {
        adapter
            .setup(&home_dir, &paths.home)
            .with_context(|| format!("setup failed for tool '{}'", adapter.name()))?;
    }

    // Held for the whole session; its presence is what "active" means.
    let _session_lock = sandbox::acquire_session_lock(&paths.root)?;

    let (shell, shell_path) = sandbox::detect_shell();
    let mut composer = Composer {
        identity,
        paths: paths.clone(),
        host_home: home_dir,
        shell,
        shell_path,
        proxy: None,
    };

    if proxy_enabled {
        run_with_proxy(&cli, &config, &mut composer, &adapters, &paths)
    } else {
        let composition = composer.compose(&adapters, &cli.command)?;
        match sandbox::exec_bwrap(&composition) {
            Ok(never) => match never {},
            Err(e) => Err(e.into()),
        }
    }
}

/// Proxy mode: start the server, wrap the sandbox in the network driver,
/// wait for it, then stop the server and forward the exit code.
fn run_with_proxy(
    cli: &Cli,
    config: &Config,
    composer: &mut Composer,
    adapters: &[&dyn ToolAdapter],
    paths: &SandboxPaths,
) -> Result<i32> {
    let provider = network::select_provider()?;

    let mut proxy_config = ProxyConfig::new(
        config.proxy.port,
        paths.proxy_logs.clone(),
        paths.ca_cert.clone(),
        paths.ca_key.clone(),
        &format!("devsandbox CA {}", composer.identity.project_name),
    );
    proxy_config.filter = config.filter.clone();
    proxy_config.credentials = config.proxy.credentials.clone();
    proxy_config.redact_headers = config.proxy.redact_headers.clone();
    proxy_config.log_max_size = config.proxy.log_max_size;
    proxy_config.log_max_files = config.proxy.log_max_files;
    proxy_config.upstream_ca_files = config.proxy.upstream_ca_files.clone();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to create tokio runtime")?;

    let server = Arc::new(ProxyServer::new(proxy_config, None)?);
    let addr = runtime.block_on(server.start())?;
    info!("Proxy listening on {}", addr);

    composer.proxy = Some(ProxyEndpoint {
        gateway_ip: provider.gateway_ip().to_string(),
        port: addr.port(),
        ca_cert_path: paths.ca_cert.clone(),
    });

    let composition = composer.compose(adapters, &cli.command)?;
    let status = provider.run(&composition.bwrap_args, &composition.shell_cmd);

    runtime.block_on(server.stop())?;

    let status = status?;
    Ok(status.code().unwrap_or(1))
}

fn print_info(
    identity: &SandboxIdentity,
    paths: &SandboxPaths,
    proxy_enabled: bool,
    adapters: &[&dyn ToolAdapter],
) {
    println!("Sandbox Configuration:");
    println!("  Project:      {}", identity.project_dir.display());
    println!("  Name:         {}", identity.project_name);
    println!("  Sandbox Home: {}", paths.home.display());
    println!("  Proxy mode:   {}", if proxy_enabled { "on" } else { "off" });
    println!(
        "  Session:      {}",
        if sandbox::is_session_active(&paths.root) {
            "active"
        } else {
            "idle"
        }
    );
    println!("  Blocked Paths:");
    for blocked in sandbox::BLOCKED_HOME_DIRS {
        println!("    ~/{blocked}");
    }
    for blocked in sandbox::BLOCKED_PROJECT_FILES {
        println!("    {blocked} (project)");
    }
    println!("  Tools:");
    for adapter in adapters {
        println!("    {} - {}", adapter.name(), adapter.description());
    }
}

/// Initialize tracing: stderr for the operator, plus an internal
/// diagnostics file under the sandbox's log directory.
fn init_tracing(verbose: u8, internal_logs: &Path) -> Result<()> {
    use tracing_subscriber::{fmt, prelude::*, EnvFilter};

    let filter = match verbose {
        0 => EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")),
        1 => EnvFilter::new("info"),
        2 => EnvFilter::new("debug"),
        _ => EnvFilter::new("trace"),
    };

    let file = std::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(internal_logs.join("devsandbox.log"))
        .context("failed to open internal log file")?;

    tracing_subscriber::registry()
        .with(fmt::layer().with_writer(std::io::stderr))
        .with(fmt::layer().with_ansi(false).with_writer(Arc::new(file)))
        .with(filter)
        .try_init()
        .map_err(|e| anyhow::anyhow!("failed to initialize tracing: {e}"))?;

    Ok(())
}

/// Map error kinds onto the documented exit codes.
fn exit_code_for(err: &anyhow::Error) -> i32 {
    if let Some(sandbox_err) = err.downcast_ref::<SandboxError>() {
        return match sandbox_err {
            SandboxError::BwrapMissing => EXIT_BWRAP_MISSING,
            _ => 1,
        };
    }
    if let Some(net_err) = err.downcast_ref::<NetworkError>() {
        return match net_err {
            NetworkError::PastaMissing => EXIT_PASTA_MISSING,
            NetworkError::BwrapMissing => EXIT_BWRAP_MISSING,
            NetworkError::Run(_) => 1,
        };
    }
    if let Some(proxy_err) = err.downcast_ref::<ProxyError>() {
        return match proxy_err {
            ProxyError::PortExhausted { .. } => EXIT_PORT_EXHAUSTED,
            ProxyError::Ca(_) => EXIT_CA_FAILED,
            _ => 1,
        };
    }
    if err.downcast_ref::<ConfigError>().is_some() {
        return EXIT_CONFIG_INVALID;
    }
    if err.downcast_ref::<CaError>().is_some() {
        return EXIT_CA_FAILED;
    }
    1
}
