//! The TLS-intercepting filtering proxy server.
//!
//! One listener on loopback accepts both plain proxy requests and CONNECT
//! tunnels. CONNECT targets are terminated with a leaf minted by the
//! per-sandbox CA, and every request inside the tunnel goes through the
//! same pipeline as plain requests:
//!
//! ```text
//! capture → filter (allow | block | ask) → inject credentials → forward → log
//! ```
//!
//! Upstream connections always verify the real server certificate; the
//! sandboxed client only ever sees our leafs.
//!
//! Port binding starts at the configured port and walks forward on
//! `EADDRINUSE` up to [`MAX_PORT_RETRIES`]; the bound address is reported
//! back so the composer can inject the right proxy URL.

use super::ca::CertificateAuthority;
use super::credentials::{CredentialInjector, CredentialRecipe};
use super::error::ProxyError;
use super::filter::{
    Asker, FilterAction, FilterConfig, FilterEngine, RequestFingerprint,
};
use super::reqlog::RequestLogger;
use super::rotating::{DEFAULT_MAX_FILES, DEFAULT_MAX_SIZE};
use super::tls::{leaf_acceptor, server_name, upstream_connector};
use bytes::Bytes;
use http_body_util::{combinators::BoxBody, BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::header::{HeaderValue, HOST};
use hyper::http::request;
use hyper::server::conn::http1 as server_http1;
use hyper::service::service_fn;
use hyper::upgrade::Upgraded;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tokio::task::{JoinHandle, JoinSet};
use tokio_rustls::TlsConnector;
use tracing::{debug, info, warn};

/// How many consecutive ports are tried before giving up.
pub const MAX_PORT_RETRIES: u16 = 10;

/// Response body type used throughout the proxy.
pub type ProxyBody = BoxBody<Bytes, hyper::Error>;

/// Runtime configuration for one proxy server.
#[derive(Debug, Clone)]
pub struct ProxyConfig {
    /// Port to bind on loopback; 0 asks the OS for any free port.
    pub port: u16,
    /// Directory for rotating request logs.
    pub log_dir: PathBuf,
    /// Path to the persisted CA certificate.
    pub ca_cert_path: PathBuf,
    /// Path to the persisted CA private key.
    pub ca_key_path: PathBuf,
    /// Common name for a freshly generated CA.
    pub ca_common_name: String,
    /// Filter configuration.
    pub filter: FilterConfig,
    /// Credential recipes by label.
    pub credentials: HashMap<String, CredentialRecipe>,
    /// Header names redacted in request logs.
    pub redact_headers: Vec<String>,
    /// Rotation threshold for request logs.
    pub log_max_size: u64,
    /// Retention count for request logs.
    pub log_max_files: usize,
    /// Extra PEM root files trusted for upstream verification.
    pub upstream_ca_files: Vec<PathBuf>,
    /// Deadline for upstream dial + TLS handshake.
    pub connect_timeout: Duration,
    /// How long `stop` waits for in-flight connections.
    pub drain_timeout: Duration,
}

impl ProxyConfig {
    /// Config with defaults for everything but the paths and port.
    pub fn new(port: u16, log_dir: PathBuf, ca_cert: PathBuf, ca_key: PathBuf, cn: &str) -> Self {
        Self {
            port,
            log_dir,
            ca_cert_path: ca_cert,
            ca_key_path: ca_key,
            ca_common_name: cn.to_string(),
            filter: FilterConfig::default(),
            credentials: HashMap::new(),
            redact_headers: Vec::new(),
            log_max_size: DEFAULT_MAX_SIZE,
            log_max_files: DEFAULT_MAX_FILES,
            upstream_ca_files: Vec::new(),
            connect_timeout: Duration::from_secs(30),
            drain_timeout: Duration::from_secs(5),
        }
    }
}

/// Shared per-request context handed to connection tasks.
#[derive(Clone)]
struct RequestContext {
    ca: Arc<CertificateAuthority>,
    reqlog: Arc<RequestLogger>,
    filter: Arc<FilterEngine>,
    credentials: Arc<CredentialInjector>,
    upstream_tls: TlsConnector,
    connect_timeout: Duration,
}

struct Lifecycle {
    shutdown: Option<watch::Sender<bool>>,
    accept_task: Option<JoinHandle<()>>,
}

/// The MITM proxy server.
pub struct ProxyServer {
    config: ProxyConfig,
    ca: Arc<CertificateAuthority>,
    reqlog: Arc<RequestLogger>,
    filter: Arc<FilterEngine>,
    credentials: Arc<CredentialInjector>,
    upstream_tls: TlsConnector,
    running: AtomicBool,
    bound: Mutex<Option<SocketAddr>>,
    lifecycle: tokio::sync::Mutex<Lifecycle>,
}

impl ProxyServer {
    /// Construct the server: load the CA, open the log sink, compile the
    /// filter, load credentials. All failures here are fatal; the proxy
    /// never starts half-initialized.
    pub fn new(config: ProxyConfig, asker: Option<Arc<dyn Asker>>) -> Result<Self, ProxyError> {
        let ca = Arc::new(CertificateAuthority::load_or_create(
            &config.ca_cert_path,
            &config.ca_key_path,
            &config.ca_common_name,
        )?);

        let reqlog = Arc::new(
            RequestLogger::new(
                &config.log_dir,
                config.log_max_size,
                config.log_max_files,
                &config.redact_headers,
            )
            .map_err(ProxyError::LogSink)?,
        );

        let filter = Arc::new(FilterEngine::from_config(&config.filter, asker)?);

        let credentials = Arc::new(CredentialInjector::load(&config.credentials)?);
        let upstream_tls = upstream_connector(&config.upstream_ca_files)?;

        Ok(Self {
            config,
            ca,
            reqlog,
            filter,
            credentials,
            upstream_tls,
            running: AtomicBool::new(false),
            bound: Mutex::new(None),
            lifecycle: tokio::sync::Mutex::new(Lifecycle {
                shutdown: None,
                accept_task: None,
            }),
        })
    }

    /// Bind and start serving in a background task. Returns the bound
    /// address once listening. Calling `start` twice is an error.
    pub async fn start(&self) -> Result<SocketAddr, ProxyError> {
        let mut lifecycle = self.lifecycle.lock().await;
        if self.running.load(Ordering::SeqCst) {
            return Err(ProxyError::AlreadyRunning);
        }

        let listener = self.bind().await?;
        let addr = listener.local_addr()?;
        *self.bound.lock().unwrap() = Some(addr);
        self.running.store(true, Ordering::SeqCst);

        info!("Proxy server listening on {}", addr);

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let ctx = RequestContext {
            ca: self.ca.clone(),
            reqlog: self.reqlog.clone(),
            filter: self.filter.clone(),
            credentials: self.credentials.clone(),
            upstream_tls: self.upstream_tls.clone(),
            connect_timeout: self.config.connect_timeout,
        };
        let drain = self.config.drain_timeout;
        let accept_task = tokio::spawn(accept_loop(listener, ctx, shutdown_rx, drain));

        lifecycle.shutdown = Some(shutdown_tx);
        lifecycle.accept_task = Some(accept_task);

        Ok(addr)
    }

    async fn bind(&self) -> Result<TcpListener, ProxyError> {
        let first = self.config.port;
        let attempts = if first == 0 { 1 } else { MAX_PORT_RETRIES };

        for offset in 0..attempts {
            let port = first.saturating_add(offset);
            match TcpListener::bind(("127.0.0.1", port)).await {
                Ok(listener) => return Ok(listener),
                Err(e) if e.kind() == std::io::ErrorKind::AddrInUse => {
                    debug!("Port {} in use, trying next", port);
                }
                Err(e) => return Err(ProxyError::Io(e)),
            }
        }

        Err(ProxyError::PortExhausted {
            first,
            last: first.saturating_add(attempts - 1),
        })
    }

    /// Close the listener, let in-flight connections finish up to the drain
    /// deadline, then close the log sink.
    pub async fn stop(&self) -> Result<(), ProxyError> {
        let mut lifecycle = self.lifecycle.lock().await;
        if !self.running.load(Ordering::SeqCst) {
            return Ok(());
        }

        if let Some(shutdown) = lifecycle.shutdown.take() {
            let _ = shutdown.send(true);
        }
        if let Some(task) = lifecycle.accept_task.take() {
            let deadline = self.config.drain_timeout + Duration::from_secs(1);
            if tokio::time::timeout(deadline, task).await.is_err() {
                warn!("Accept loop did not drain in time");
            }
        }

        self.running.store(false, Ordering::SeqCst);
        if let Err(e) = self.reqlog.close() {
            warn!("Failed to close request log: {}", e);
        }

        info!("Proxy server stopped");
        Ok(())
    }

    /// Whether the serve loop is active.
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// The bound port, once started.
    pub fn port(&self) -> Option<u16> {
        self.bound.lock().unwrap().map(|a| a.port())
    }

    /// The bound address, once started.
    pub fn addr(&self) -> Option<SocketAddr> {
        *self.bound.lock().unwrap()
    }

    /// The per-sandbox CA backing this server.
    pub fn ca(&self) -> Arc<CertificateAuthority> {
        self.ca.clone()
    }
}

async fn accept_loop(
    listener: TcpListener,
    ctx: RequestContext,
    mut shutdown_rx: watch::Receiver<bool>,
    drain: Duration,
) {
    let mut connections = JoinSet::new();

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                match accepted {
                    Ok((stream, peer)) => {
                        debug!("Accepted connection from {}", peer);
                        let ctx = ctx.clone();
                        connections.spawn(async move {
                            if let Err(e) = serve_client(stream, ctx).await {
                                // Resets and early hangups are routine.
                                debug!("Connection ended: {}", e);
                            }
                        });
                    }
                    Err(e) => warn!("Accept failed: {}", e),
                }
            }
            changed = shutdown_rx.changed() => {
                // A dropped sender means the server is gone; stop either way.
                if changed.is_err() || *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }

    drop(listener);

    // Drain in-flight connections, then hard-close the stragglers.
    let drained = tokio::time::timeout(drain, async {
        while connections.join_next().await.is_some() {}
    })
    .await;
    if drained.is_err() {
        warn!("Drain deadline reached; aborting remaining connections");
        connections.shutdown().await;
    }
}

async fn serve_client(stream: TcpStream, ctx: RequestContext) -> Result<(), ProxyError> {
    let service = service_fn(move |req: Request<Incoming>| {
        let ctx = ctx.clone();
        async move { handle_request(req, ctx).await }
    });

    server_http1::Builder::new()
        .preserve_header_case(true)
        .title_case_headers(true)
        .serve_connection(TokioIo::new(stream), service)
        .with_upgrades()
        .await
        .map_err(ProxyError::from)
}

async fn handle_request(
    req: Request<Incoming>,
    ctx: RequestContext,
) -> Result<Response<ProxyBody>, ProxyError> {
    if req.method() == Method::CONNECT {
        handle_connect(req, ctx).await
    } else {
        handle_plain(req, ctx).await
    }
}

/// CONNECT: acknowledge the tunnel, then intercept it.
async fn handle_connect(
    req: Request<Incoming>,
    ctx: RequestContext,
) -> Result<Response<ProxyBody>, ProxyError> {
    let authority = req
        .uri()
        .authority()
        .ok_or_else(|| ProxyError::InvalidRequest("CONNECT without authority".into()))?
        .to_string();
    let (host, port) = parse_host_port(&authority)?;

    debug!("CONNECT {}:{}", host, port);

    tokio::spawn(async move {
        match hyper::upgrade::on(req).await {
            Ok(upgraded) => {
                if let Err(e) = mitm_tunnel(upgraded, host.clone(), port, ctx).await {
                    debug!("Tunnel for {}:{} ended: {}", host, port, e);
                }
            }
            Err(e) => warn!("Upgrade failed for {}:{}: {}", host, port, e),
        }
    });

    Ok(Response::builder()
        .status(StatusCode::OK)
        .body(empty_body())
        .expect("static response"))
}

/// Terminate client TLS with a minted leaf and serve the requests inside
/// the tunnel through the normal pipeline.
async fn mitm_tunnel(
    upgraded: Upgraded,
    host: String,
    port: u16,
    ctx: RequestContext,
) -> Result<(), ProxyError> {
    let leaf = ctx.ca.leaf_for(&host)?;
    let acceptor = leaf_acceptor(leaf);

    let tls_stream = acceptor
        .accept(TokioIo::new(upgraded))
        .await
        .map_err(|e| ProxyError::Tls(format!("client handshake failed: {e}")))?;

    let service = service_fn(move |req: Request<Incoming>| {
        let ctx = ctx.clone();
        let host = host.clone();
        async move {
            let url = tunnel_url(&host, port, req.uri());
            proxy_transaction(req, host, port, true, url, ctx).await
        }
    });

    server_http1::Builder::new()
        .preserve_header_case(true)
        .serve_connection(TokioIo::new(tls_stream), service)
        .await
        .map_err(ProxyError::from)
}

/// Plain (absolute-form) HTTP proxying.
async fn handle_plain(
    req: Request<Incoming>,
    ctx: RequestContext,
) -> Result<Response<ProxyBody>, ProxyError> {
    let uri = req.uri();
    let host = uri
        .host()
        .ok_or_else(|| ProxyError::InvalidRequest("request URI has no host".into()))?
        .to_string();
    let tls = uri.scheme_str() == Some("https");
    let port = uri.port_u16().unwrap_or(if tls { 443 } else { 80 });
    let url = uri.to_string();

    proxy_transaction(req, host, port, tls, url, ctx).await
}

/// The shared request pipeline: capture, filter, inject, forward, log.
async fn proxy_transaction(
    req: Request<Incoming>,
    host: String,
    port: u16,
    tls: bool,
    url: String,
    ctx: RequestContext,
) -> Result<Response<ProxyBody>, ProxyError> {
    let started = Instant::now();
    let (mut parts, body) = req.into_parts();
    let body_bytes = body.collect().await?.to_bytes();

    let mut record = ctx
        .reqlog
        .begin(&parts.method, &url, &parts.headers, &body_bytes);

    let path = parts.uri.path().to_string();
    let decision = ctx
        .filter
        .decide(RequestFingerprint {
            host: &host,
            path: &path,
            url: &url,
        })
        .await;

    if decision.action == FilterAction::Block {
        info!("Blocked {} {} ({})", parts.method, url, decision.reason);
        let body = Bytes::from(format!(
            "devsandbox proxy: request blocked: {}\n",
            decision.reason
        ));
        let response = Response::builder()
            .status(StatusCode::FORBIDDEN)
            .header("content-type", "text/plain")
            .body(full_body(body.clone()))
            .expect("static response");
        ctx.reqlog.complete(
            &mut record,
            Some((response.status().as_u16(), response.headers(), &body)),
            started,
        );
        ctx.reqlog.log(&record);
        return Ok(response);
    }

    ctx.credentials.apply(&host, &mut parts.headers);

    match forward_upstream(&ctx, &parts, body_bytes, &host, port, tls).await {
        Ok(upstream) => {
            let (resp_parts, resp_body) = upstream.into_parts();
            let resp_bytes = resp_body.collect().await?.to_bytes();

            ctx.reqlog.complete(
                &mut record,
                Some((resp_parts.status.as_u16(), &resp_parts.headers, &resp_bytes)),
                started,
            );
            ctx.reqlog.log(&record);

            let mut builder = Response::builder().status(resp_parts.status);
            for (name, value) in resp_parts.headers.iter() {
                if !is_hop_by_hop(name.as_str()) {
                    builder = builder.header(name, value);
                }
            }
            Ok(builder
                .body(full_body(resp_bytes))
                .map_err(|e| ProxyError::InvalidRequest(e.to_string()))?)
        }
        Err(e) => {
            warn!("Upstream failure for {}: {}", url, e);
            ctx.reqlog.complete(&mut record, None, started);
            record.error = Some(e.to_string());
            ctx.reqlog.log(&record);

            Ok(Response::builder()
                .status(StatusCode::BAD_GATEWAY)
                .header("content-type", "text/plain")
                .body(full_body(Bytes::from(format!(
                    "devsandbox proxy: upstream error: {e}\n"
                ))))
                .expect("static response"))
        }
    }
}

/// Dial the upstream, re-originate the request, return its response.
async fn forward_upstream(
    ctx: &RequestContext,
    parts: &request::Parts,
    body: Bytes,
    host: &str,
    port: u16,
    tls: bool,
) -> Result<Response<Incoming>, ProxyError> {
    let addr = format!("{host}:{port}");
    let dial = TcpStream::connect(&addr);
    let stream = tokio::time::timeout(ctx.connect_timeout, dial)
        .await
        .map_err(|_| ProxyError::UpstreamConnect {
            addr: addr.clone(),
            message: "connect timed out".to_string(),
        })?
        .map_err(|e| ProxyError::UpstreamConnect {
            addr: addr.clone(),
            message: e.to_string(),
        })?;

    let outbound = build_outbound(parts, body, host, port)?;

    if tls {
        let name = server_name(host)?;
        let handshake = ctx.upstream_tls.connect(name, stream);
        let tls_stream = tokio::time::timeout(ctx.connect_timeout, handshake)
            .await
            .map_err(|_| ProxyError::Tls("upstream TLS handshake timed out".to_string()))?
            .map_err(|e| ProxyError::Tls(format!("upstream handshake failed: {e}")))?;
        send_over(tls_stream, outbound).await
    } else {
        send_over(stream, outbound).await
    }
}

async fn send_over<S>(stream: S, req: Request<Full<Bytes>>) -> Result<Response<Incoming>, ProxyError>
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + 'static,
{
    let (mut sender, connection) = hyper::client::conn::http1::handshake(TokioIo::new(stream))
        .await
        .map_err(ProxyError::from)?;

    tokio::spawn(async move {
        if let Err(e) = connection.await {
            debug!("Upstream connection ended: {}", e);
        }
    });

    sender.send_request(req).await.map_err(ProxyError::from)
}

/// Rebuild the captured request in origin-form for the upstream.
fn build_outbound(
    parts: &request::Parts,
    body: Bytes,
    host: &str,
    port: u16,
) -> Result<Request<Full<Bytes>>, ProxyError> {
    let path_and_query = parts
        .uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");

    let mut builder = Request::builder().method(parts.method.clone()).uri(path_and_query);

    for (name, value) in parts.headers.iter() {
        if !is_hop_by_hop(name.as_str()) {
            builder = builder.header(name, value);
        }
    }

    let mut req = builder
        .body(Full::new(body))
        .map_err(|e| ProxyError::InvalidRequest(e.to_string()))?;

    if !req.headers().contains_key(HOST) {
        let value = if port == 80 || port == 443 {
            host.to_string()
        } else {
            format!("{host}:{port}")
        };
        req.headers_mut().insert(
            HOST,
            HeaderValue::from_str(&value)
                .map_err(|e| ProxyError::InvalidRequest(e.to_string()))?,
        );
    }

    Ok(req)
}

/// Absolute URL for a request seen inside a CONNECT tunnel.
fn tunnel_url(host: &str, port: u16, uri: &hyper::Uri) -> String {
    let path = uri
        .path_and_query()
        .map(|pq| pq.as_str())
        .unwrap_or("/");
    if port == 443 {
        format!("https://{host}{path}")
    } else {
        format!("https://{host}:{port}{path}")
    }
}

fn parse_host_port(authority: &str) -> Result<(String, u16), ProxyError> {
    if let Some((host, port_str)) = authority.rsplit_once(':') {
        if host.starts_with('[') && host.ends_with(']') {
            let port = port_str
                .parse::<u16>()
                .map_err(|_| ProxyError::InvalidRequest(format!("invalid port: {port_str}")))?;
            return Ok((host[1..host.len() - 1].to_string(), port));
        }
        let port = port_str
            .parse::<u16>()
            .map_err(|_| ProxyError::InvalidRequest(format!("invalid port: {port_str}")))?;
        Ok((host.to_string(), port))
    } else {
        Ok((authority.to_string(), 443))
    }
}

fn is_hop_by_hop(name: &str) -> bool {
    matches!(
        name.to_ascii_lowercase().as_str(),
        "connection"
            | "proxy-connection"
            | "proxy-authorization"
            | "keep-alive"
            | "te"
            | "trailer"
            | "transfer-encoding"
            | "upgrade"
    )
}

fn empty_body() -> ProxyBody {
    Empty::<Bytes>::new().map_err(|never| match never {}).boxed()
}

fn full_body(content: Bytes) -> ProxyBody {
    Full::new(content).map_err(|never| match never {}).boxed()
}
