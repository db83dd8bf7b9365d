//! TLS plumbing for the MITM proxy.
//!
//! Two directions:
//! - **acceptor**: terminates TLS from the sandboxed client using the leaf
//!   minted for the CONNECT host
//! - **connector**: re-originates a verified TLS connection to the real
//!   upstream, trusting the system roots plus any configured extra roots
//!
//! ALPN on the accept side is pinned to HTTP/1.1. Allowing H2 negotiation
//! would hand our HTTP/1 tunnel parser a framed binary stream.

use super::error::ProxyError;
use rustls::server::ResolvesServerCert;
use rustls::sign::CertifiedKey;
use rustls::{ClientConfig, ServerConfig};
use rustls_pki_types::ServerName;
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::debug;

/// Resolver that always presents one pre-minted leaf.
///
/// The CONNECT authority already names the host, so there is no need to
/// inspect SNI; the leaf was minted for exactly that host.
struct FixedCertResolver(Arc<CertifiedKey>);

impl std::fmt::Debug for FixedCertResolver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FixedCertResolver").finish_non_exhaustive()
    }
}

impl ResolvesServerCert for FixedCertResolver {
    fn resolve(
        &self,
        _client_hello: rustls::server::ClientHello<'_>,
    ) -> Option<Arc<CertifiedKey>> {
        Some(self.0.clone())
    }
}

/// Build an acceptor presenting `leaf` to the sandboxed client.
pub fn leaf_acceptor(leaf: Arc<CertifiedKey>) -> TlsAcceptor {
    let mut config = ServerConfig::builder()
        .with_no_client_auth()
        .with_cert_resolver(Arc::new(FixedCertResolver(leaf)));

    // H2 upgrade would break the per-request handling inside the tunnel.
    config.alpn_protocols = vec![b"http/1.1".to_vec()];

    TlsAcceptor::from(Arc::new(config))
}

/// Build the upstream connector: system roots plus `extra_roots` PEM files.
///
/// Extra roots cover private registries and test origins whose CAs are not
/// in the system store. Upstream certificates are always verified; the
/// proxy never blindly trusts the far side.
pub fn upstream_connector(extra_roots: &[PathBuf]) -> Result<TlsConnector, ProxyError> {
    let mut root_store = rustls::RootCertStore::empty();

    let native = rustls_native_certs::load_native_certs();
    for err in native.errors {
        debug!("Skipping unloadable native cert: {}", err);
    }
    for cert in native.certs {
        if let Err(e) = root_store.add(cert) {
            debug!("Skipping unaddable native cert: {}", e);
        }
    }

    for path in extra_roots {
        for cert in read_pem_certs(path)? {
            root_store
                .add(cert)
                .map_err(|e| ProxyError::Tls(format!("bad extra root in {path:?}: {e}")))?;
        }
    }

    if root_store.is_empty() {
        return Err(ProxyError::Tls("no trusted root certificates found".into()));
    }

    let config = ClientConfig::builder()
        .with_root_certificates(root_store)
        .with_no_client_auth();

    Ok(TlsConnector::from(Arc::new(config)))
}

/// Convert a host string into a rustls `ServerName`.
pub fn server_name(host: &str) -> Result<ServerName<'static>, ProxyError> {
    ServerName::try_from(host.to_string())
        .map_err(|_| ProxyError::Tls(format!("invalid server name: {host}")))
}

fn read_pem_certs(
    path: &Path,
) -> Result<Vec<rustls_pki_types::CertificateDer<'static>>, ProxyError> {
    let file = File::open(path).map_err(|e| ProxyError::Tls(format!("open {path:?}: {e}")))?;
    rustls_pemfile::certs(&mut BufReader::new(file))
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| ProxyError::Tls(format!("parse {path:?}: {e}")))
}
