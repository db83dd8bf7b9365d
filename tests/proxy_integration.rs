//! End-to-end proxy tests: plain HTTP forwarding, HTTPS interception,
//! port collision handling, filter blocking, ask timeouts, and the
//! request log round-trip.

use bytes::Bytes;
use devsandbox::proxy::filter::{
    AskPrompt, Asker, FilterAction, FilterConfig, FilterRule, FilterScope,
};
use devsandbox::proxy::reqlog::{RequestRecord, LOG_FILE_PREFIX, LOG_FILE_SUFFIX};
use devsandbox::proxy::{rotating, ProxyConfig, ProxyError, ProxyServer};
use http_body_util::{BodyExt, Empty, Full};
use hyper::body::Incoming;
use hyper::server::conn::http1 as server_http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue, IsCa, Issuer,
    KeyPair, KeyUsagePurpose, SanType,
};
use rustls_pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer, ServerName};
use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio_rustls::{TlsAcceptor, TlsConnector};

struct TestDirs {
    _tmp: tempfile::TempDir,
    log_dir: PathBuf,
    ca_cert: PathBuf,
    ca_key: PathBuf,
}

fn test_dirs() -> TestDirs {
    let tmp = tempfile::tempdir().unwrap();
    let log_dir = tmp.path().join("logs");
    let ca_cert = tmp.path().join("ca.crt");
    let ca_key = tmp.path().join("ca.key");
    TestDirs {
        _tmp: tmp,
        log_dir,
        ca_cert,
        ca_key,
    }
}

fn proxy_config(dirs: &TestDirs, port: u16) -> ProxyConfig {
    ProxyConfig::new(
        port,
        dirs.log_dir.clone(),
        dirs.ca_cert.clone(),
        dirs.ca_key.clone(),
        "devsandbox CA integration-test",
    )
}

/// Plain HTTP origin returning `body` for every request.
async fn spawn_origin(body: &'static str) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let service = service_fn(move |_req: Request<Incoming>| async move {
                    Ok::<_, Infallible>(Response::new(Full::new(Bytes::from(body))))
                });
                let _ = server_http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });
    addr
}

/// One GET through the proxy using an absolute-form request target.
async fn proxy_get(proxy: SocketAddr, url: &str) -> (StatusCode, Bytes) {
    let stream = TcpStream::connect(proxy).await.unwrap();
    let (mut sender, conn) =
        hyper::client::conn::http1::handshake::<_, Empty<Bytes>>(TokioIo::new(stream))
            .await
            .unwrap();
    tokio::spawn(conn);

    let req = Request::builder()
        .method(Method::GET)
        .uri(url)
        .body(Empty::new())
        .unwrap();
    let resp = sender.send_request(req).await.unwrap();
    let status = resp.status();
    let body = resp.into_body().collect().await.unwrap().to_bytes();
    (status, body)
}

fn read_log_records(log_dir: &Path) -> Vec<RequestRecord> {
    let content = rotating::read_all(log_dir, LOG_FILE_PREFIX, LOG_FILE_SUFFIX).unwrap();
    content
        .split(|&b| b == b'\n')
        .filter(|line| !line.is_empty())
        .map(|line| serde_json::from_slice(line).unwrap())
        .collect()
}

#[tokio::test(flavor = "multi_thread")]
async fn http_through_proxy_round_trips_and_logs() {
    let origin = spawn_origin("ok").await;
    let dirs = test_dirs();

    let server = ProxyServer::new(proxy_config(&dirs, 0), None).unwrap();
    let addr = server.start().await.unwrap();
    assert!(server.is_running());

    let url = format!("http://127.0.0.1:{}/hello", origin.port());
    let (status, body) = proxy_get(addr, &url).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(&body[..], b"ok");

    server.stop().await.unwrap();
    assert!(!server.is_running());

    let records = read_log_records(&dirs.log_dir);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].method, "GET");
    assert_eq!(records[0].url, url);
    assert_eq!(records[0].status, Some(200));
    assert!(records[0].error.is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn second_server_binds_next_port() {
    let dirs1 = test_dirs();
    let dirs2 = test_dirs();
    let requested = 38084;

    let server1 = ProxyServer::new(proxy_config(&dirs1, requested), None).unwrap();
    let addr1 = server1.start().await.unwrap();
    assert_eq!(addr1.port(), requested);

    let server2 = ProxyServer::new(proxy_config(&dirs2, requested), None).unwrap();
    let addr2 = server2.start().await.unwrap();
    assert_eq!(addr2.port(), requested + 1);
    assert_ne!(server1.port(), server2.port());

    server1.stop().await.unwrap();
    server2.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn start_twice_fails() {
    let dirs = test_dirs();
    let server = ProxyServer::new(proxy_config(&dirs, 0), None).unwrap();

    server.start().await.unwrap();
    assert!(matches!(
        server.start().await,
        Err(ProxyError::AlreadyRunning)
    ));
    server.stop().await.unwrap();

    // Stop again is a no-op.
    server.stop().await.unwrap();
}

#[tokio::test(flavor = "multi_thread")]
async fn blocked_host_gets_403_with_reason() {
    let origin = spawn_origin("should never be seen").await;
    let dirs = test_dirs();

    let mut config = proxy_config(&dirs, 0);
    config.filter = FilterConfig {
        default_action: Some(FilterAction::Allow),
        ask_timeout: 30,
        cache_decisions: true,
        rules: vec![FilterRule {
            pattern: "127.0.0.1".to_string(),
            action: FilterAction::Block,
            scope: FilterScope::Host,
            pattern_type: None,
            reason: Some("loopback blocked in test".to_string()),
        }],
    };

    let server = ProxyServer::new(config, None).unwrap();
    let addr = server.start().await.unwrap();

    let url = format!("http://127.0.0.1:{}/x", origin.port());
    let (status, body) = proxy_get(addr, &url).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert!(String::from_utf8_lossy(&body).contains("loopback blocked in test"));

    server.stop().await.unwrap();

    let records = read_log_records(&dirs.log_dir);
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].status, Some(403));
}

/// An asker that never answers; pending senders are kept alive so the
/// engine has to hit its deadline rather than a closed channel.
struct NeverAsker {
    pending: Mutex<Vec<oneshot::Sender<FilterAction>>>,
}

impl Asker for NeverAsker {
    fn ask(&self, _prompt: AskPrompt) -> oneshot::Receiver<FilterAction> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().unwrap().push(tx);
        rx
    }
}

#[tokio::test(flavor = "multi_thread")]
async fn ask_timeout_falls_back_to_block() {
    let origin = spawn_origin("unreached").await;
    let dirs = test_dirs();

    let mut config = proxy_config(&dirs, 0);
    config.filter = FilterConfig {
        default_action: Some(FilterAction::Block),
        ask_timeout: 1,
        cache_decisions: true,
        rules: vec![FilterRule {
            pattern: "127.0.0.1".to_string(),
            action: FilterAction::Ask,
            scope: FilterScope::Host,
            pattern_type: None,
            reason: None,
        }],
    };

    let asker = Arc::new(NeverAsker {
        pending: Mutex::new(Vec::new()),
    });
    let server = ProxyServer::new(config, Some(asker)).unwrap();
    let addr = server.start().await.unwrap();

    let url = format!("http://127.0.0.1:{}/x", origin.port());
    let started = Instant::now();
    let (status, _body) = proxy_get(addr, &url).await;
    let elapsed = started.elapsed();

    assert_eq!(status, StatusCode::FORBIDDEN);
    assert!(elapsed >= Duration::from_millis(900), "elapsed {elapsed:?}");
    assert!(elapsed < Duration::from_secs(10), "elapsed {elapsed:?}");

    server.stop().await.unwrap();
}

/// CA + leaf for the TLS test origin; the CA PEM goes into the proxy's
/// extra upstream roots.
fn origin_tls(dir: &Path) -> (PathBuf, TlsAcceptor) {
    let ca_key = KeyPair::generate().unwrap();
    let mut ca_params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(
        DnType::CommonName,
        DnValue::Utf8String("test origin CA".to_string()),
    );
    ca_params.distinguished_name = dn;
    ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
    ca_params.key_usages = vec![KeyUsagePurpose::KeyCertSign];
    let ca_cert = ca_params.clone().self_signed(&ca_key).unwrap();

    let ca_path = dir.join("origin-ca.pem");
    std::fs::write(&ca_path, ca_cert.pem()).unwrap();

    let leaf_key = KeyPair::generate().unwrap();
    let mut leaf_params = CertificateParams::default();
    leaf_params.subject_alt_names =
        vec![SanType::IpAddress("127.0.0.1".parse().unwrap())];
    let issuer = Issuer::from_params(&ca_params, &ca_key);
    let leaf = leaf_params.signed_by(&leaf_key, &issuer).unwrap();

    let server_config = rustls::ServerConfig::builder()
        .with_no_client_auth()
        .with_single_cert(
            vec![leaf.der().clone()],
            PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(leaf_key.serialize_der())),
        )
        .unwrap();

    (ca_path, TlsAcceptor::from(Arc::new(server_config)))
}

async fn spawn_tls_origin(acceptor: TlsAcceptor, body: &'static str) -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            let acceptor = acceptor.clone();
            tokio::spawn(async move {
                let Ok(tls) = acceptor.accept(stream).await else {
                    return;
                };
                let service = service_fn(move |_req: Request<Incoming>| async move {
                    Ok::<_, Infallible>(Response::new(Full::new(Bytes::from(body))))
                });
                let _ = server_http1::Builder::new()
                    .serve_connection(TokioIo::new(tls), service)
                    .await;
            });
        }
    });
    addr
}

/// Client TLS config trusting the proxy's CA certificate.
fn trust_proxy_ca(ca_pem: &str) -> TlsConnector {
    let mut roots = rustls::RootCertStore::empty();
    for cert in rustls_pemfile::certs(&mut ca_pem.as_bytes()) {
        roots.add(cert.unwrap()).unwrap();
    }
    let config = rustls::ClientConfig::builder()
        .with_root_certificates(roots)
        .with_no_client_auth();
    TlsConnector::from(Arc::new(config))
}

#[tokio::test(flavor = "multi_thread")]
async fn https_mitm_intercepts_and_logs() {
    let tmp = tempfile::tempdir().unwrap();
    let (origin_ca, acceptor) = origin_tls(tmp.path());
    let origin = spawn_tls_origin(acceptor, "tls-ok").await;

    let dirs = test_dirs();
    let mut config = proxy_config(&dirs, 0);
    config.upstream_ca_files = vec![origin_ca];

    let server = ProxyServer::new(config, None).unwrap();
    let addr = server.start().await.unwrap();

    // CONNECT to the origin through the proxy.
    let stream = TcpStream::connect(addr).await.unwrap();
    let (mut sender, conn) =
        hyper::client::conn::http1::handshake::<_, Empty<Bytes>>(TokioIo::new(stream))
            .await
            .unwrap();
    tokio::spawn(conn.with_upgrades());

    let connect = Request::builder()
        .method(Method::CONNECT)
        .uri(format!("127.0.0.1:{}", origin.port()))
        .body(Empty::new())
        .unwrap();
    let resp = sender.send_request(connect).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    // Inside the tunnel: TLS against the proxy's minted leaf. A
    // successful handshake against our trust root is the leaf check:
    // the chain must end at the sandbox CA and carry the right IP SAN.
    let upgraded = hyper::upgrade::on(resp).await.unwrap();
    let connector = trust_proxy_ca(server.ca().cert_pem());
    let name = ServerName::try_from("127.0.0.1").unwrap();
    let tls = connector
        .connect(name, TokioIo::new(upgraded))
        .await
        .expect("client must trust the minted leaf");

    let (mut tunnel_sender, tunnel_conn) =
        hyper::client::conn::http1::handshake::<_, Empty<Bytes>>(TokioIo::new(tls))
            .await
            .unwrap();
    tokio::spawn(tunnel_conn);

    let req = Request::builder()
        .method(Method::GET)
        .uri("/secure")
        .header("host", format!("127.0.0.1:{}", origin.port()))
        .body(Empty::new())
        .unwrap();
    let resp = tunnel_sender.send_request(req).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    let body = resp.into_body().collect().await.unwrap().to_bytes();
    assert_eq!(&body[..], b"tls-ok");

    server.stop().await.unwrap();

    let records = read_log_records(&dirs.log_dir);
    assert_eq!(records.len(), 1);
    assert_eq!(
        records[0].url,
        format!("https://127.0.0.1:{}/secure", origin.port())
    );
    assert_eq!(records[0].status, Some(200));
}

#[tokio::test(flavor = "multi_thread")]
async fn upstream_unreachable_yields_502_and_error_record() {
    let dirs = test_dirs();
    let mut config = proxy_config(&dirs, 0);
    config.connect_timeout = Duration::from_secs(2);

    let server = ProxyServer::new(config, None).unwrap();
    let addr = server.start().await.unwrap();

    // A port nothing listens on.
    let closed = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let dead_port = closed.local_addr().unwrap().port();
    drop(closed);

    let url = format!("http://127.0.0.1:{dead_port}/x");
    let (status, _body) = proxy_get(addr, &url).await;
    assert_eq!(status, StatusCode::BAD_GATEWAY);

    server.stop().await.unwrap();

    let records = read_log_records(&dirs.log_dir);
    assert_eq!(records.len(), 1);
    assert!(records[0].error.is_some());
    assert!(records[0].status.is_none());
}

#[tokio::test(flavor = "multi_thread")]
async fn credentials_are_injected_but_not_logged() {
    std::env::set_var("DEVSANDBOX_ITEST_TOKEN", "supersecret");

    // Origin that echoes the authorization header back in the body.
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let origin = listener.local_addr().unwrap();
    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(async move {
                let service = service_fn(|req: Request<Incoming>| async move {
                    let auth = req
                        .headers()
                        .get("authorization")
                        .map(|v| v.to_str().unwrap_or("").to_string())
                        .unwrap_or_default();
                    Ok::<_, Infallible>(Response::new(Full::new(Bytes::from(auth))))
                });
                let _ = server_http1::Builder::new()
                    .serve_connection(TokioIo::new(stream), service)
                    .await;
            });
        }
    });

    let dirs = test_dirs();
    let mut config = proxy_config(&dirs, 0);
    config.credentials.insert(
        "itest".to_string(),
        devsandbox::proxy::CredentialRecipe {
            hosts: vec!["127.0.0.1".to_string()],
            header: "Authorization".to_string(),
            format: "Bearer {}".to_string(),
            from_env: "DEVSANDBOX_ITEST_TOKEN".to_string(),
            enabled: true,
        },
    );

    let server = ProxyServer::new(config, None).unwrap();
    let addr = server.start().await.unwrap();

    let url = format!("http://127.0.0.1:{}/whoami", origin.port());
    let (status, body) = proxy_get(addr, &url).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(&body[..], b"Bearer supersecret");

    server.stop().await.unwrap();

    // The secret was attached after capture: it must not be in the log.
    let records = read_log_records(&dirs.log_dir);
    assert_eq!(records.len(), 1);
    assert!(!records[0].req_headers.contains_key("authorization"));
    let raw = serde_json::to_string(&records[0]).unwrap();
    assert!(!raw.contains("supersecret"));
}
