//! Per-sandbox certificate authority for TLS interception.
//!
//! Unlike a throwaway MITM CA, the authority here is persistent: the root
//! certificate and key live inside the sandbox root (`ca.crt` / `ca.key`)
//! and survive runs, so the sandboxed tool only has to trust one certificate
//! per project. The key never leaves the sandbox root.
//!
//! Leaf certificates are minted on demand per host, signed by the root, and
//! cached in memory for the lifetime of one proxy run. The cache is bounded
//! and evicts least-recently-used entries. Leafs are never persisted.

use super::error::CaError;
use lru::LruCache;
use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, DnValue, IsCa, Issuer,
    KeyPair, KeyUsagePurpose, SanType, SerialNumber,
};
use rustls::sign::CertifiedKey;
use rustls_pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};
use std::fs;
use std::io::Write;
use std::net::IpAddr;
use std::num::NonZeroUsize;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use time::{Duration, OffsetDateTime};
use tracing::{debug, info};

/// Root certificate validity: ten years.
const CA_VALIDITY_DAYS: i64 = 3650;

/// Leaf certificate validity. Bounded by the CA validity at mint time.
const LEAF_VALIDITY_DAYS: i64 = 90;

/// Maximum number of leaf certificates kept in memory per proxy run.
const LEAF_CACHE_CAPACITY: usize = 64;

/// Persistent per-sandbox certificate authority.
pub struct CertificateAuthority {
    cert_path: PathBuf,
    key_path: PathBuf,
    issuer: Issuer<'static, KeyPair>,
    ca_cert_pem: String,
    ca_not_after: OffsetDateTime,
    /// Strictly increasing leaf serial, per proxy run.
    serial: AtomicU64,
    /// Leaf cache keyed by lowercased host. The mutex is held across minting
    /// so concurrent CONNECTs to the same host produce one identical leaf.
    leafs: Mutex<LruCache<String, Arc<CertifiedKey>>>,
}

impl CertificateAuthority {
    /// Load the CA from `cert_path`/`key_path`, generating and persisting a
    /// new one if either file is missing.
    ///
    /// # Errors
    ///
    /// Returns an error if stored material cannot be parsed or a fresh CA
    /// cannot be generated and written. Callers treat this as fatal.
    pub fn load_or_create(
        cert_path: &Path,
        key_path: &Path,
        common_name: &str,
    ) -> Result<Self, CaError> {
        let (cert_pem, key_pair, not_after) = if cert_path.exists() && key_path.exists() {
            debug!("Loading CA from {:?}", cert_path);

            let cert_pem = fs::read_to_string(cert_path).map_err(|source| CaError::ReadFile {
                path: cert_path.to_path_buf(),
                source,
            })?;
            let key_pem = fs::read_to_string(key_path).map_err(|source| CaError::ReadFile {
                path: key_path.to_path_buf(),
                source,
            })?;
            let key_pair =
                KeyPair::from_pem(&key_pem).map_err(|e| CaError::Parse(e.to_string()))?;
            let not_after = parse_not_after(&cert_pem)?;

            (cert_pem, key_pair, not_after)
        } else {
            info!("Generating sandbox CA certificate ({})", common_name);

            let key_pair = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)
                .map_err(|e| CaError::KeyGeneration(e.to_string()))?;

            let mut params = CertificateParams::default();

            let mut dn = DistinguishedName::new();
            dn.push(DnType::CommonName, DnValue::Utf8String(common_name.to_string()));
            dn.push(DnType::OrganizationName, DnValue::Utf8String("devsandbox".to_string()));
            params.distinguished_name = dn;

            params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
            params.key_usages = vec![
                KeyUsagePurpose::KeyCertSign,
                KeyUsagePurpose::DigitalSignature,
            ];

            let now = OffsetDateTime::now_utc();
            params.not_before = now;
            params.not_after = now + Duration::days(CA_VALIDITY_DAYS);
            let not_after = params.not_after;

            let cert = params
                .self_signed(&key_pair)
                .map_err(|e| CaError::CertGeneration(e.to_string()))?;

            let cert_pem = cert.pem();
            write_atomic(cert_path, cert_pem.as_bytes())?;
            write_atomic(key_path, key_pair.serialize_pem().as_bytes())?;

            debug!("Sandbox CA persisted: cert={:?} key={:?}", cert_path, key_path);

            (cert_pem, key_pair, not_after)
        };

        let issuer = Issuer::from_ca_cert_pem(&cert_pem, key_pair)
            .map_err(|e| CaError::Parse(e.to_string()))?;

        Ok(Self {
            cert_path: cert_path.to_path_buf(),
            key_path: key_path.to_path_buf(),
            issuer,
            ca_cert_pem: cert_pem,
            ca_not_after: not_after,
            serial: AtomicU64::new(1),
            leafs: Mutex::new(LruCache::new(
                NonZeroUsize::new(LEAF_CACHE_CAPACITY).expect("nonzero capacity"),
            )),
        })
    }

    /// Path to the persisted CA certificate.
    pub fn cert_path(&self) -> &Path {
        &self.cert_path
    }

    /// Path to the persisted CA private key.
    pub fn key_path(&self) -> &Path {
        &self.key_path
    }

    /// The CA certificate as PEM.
    pub fn cert_pem(&self) -> &str {
        &self.ca_cert_pem
    }

    /// Number of cached leaf certificates.
    pub fn cached_leafs(&self) -> usize {
        self.leafs.lock().unwrap().len()
    }

    /// Get or mint a leaf certificate for `host`, ready for use as a rustls
    /// server certificate.
    ///
    /// Hosts are matched case-insensitively. IP literals get an IP SAN so
    /// clients connecting by address still verify.
    pub fn leaf_for(&self, host: &str) -> Result<Arc<CertifiedKey>, CaError> {
        let key = host.to_lowercase();

        let mut leafs = self.leafs.lock().unwrap();
        if let Some(leaf) = leafs.get(&key) {
            return Ok(leaf.clone());
        }

        debug!("Minting leaf certificate for {}", host);
        let leaf = Arc::new(self.mint(host)?);
        leafs.put(key, leaf.clone());
        Ok(leaf)
    }

    fn mint(&self, host: &str) -> Result<CertifiedKey, CaError> {
        let leaf_key = KeyPair::generate_for(&rcgen::PKCS_ECDSA_P256_SHA256)
            .map_err(|e| CaError::KeyGeneration(e.to_string()))?;

        let mut params = CertificateParams::default();

        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, DnValue::Utf8String(host.to_string()));
        params.distinguished_name = dn;

        params.subject_alt_names = vec![match host.parse::<IpAddr>() {
            Ok(addr) => SanType::IpAddress(addr),
            Err(_) => SanType::DnsName(
                host.try_into()
                    .map_err(|_| CaError::CertGeneration(format!("invalid host name: {host}")))?,
            ),
        }];

        params.serial_number = Some(SerialNumber::from(self.serial.fetch_add(1, Ordering::SeqCst)));

        let now = OffsetDateTime::now_utc();
        params.not_before = now;
        params.not_after = (now + Duration::days(LEAF_VALIDITY_DAYS)).min(self.ca_not_after);

        let leaf_cert = params
            .signed_by(&leaf_key, &self.issuer)
            .map_err(|e| CaError::CertGeneration(e.to_string()))?;

        let cert_chain = vec![leaf_cert.der().clone()];
        let private_key =
            PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(leaf_key.serialize_der()));
        let signing_key = rustls::crypto::aws_lc_rs::sign::any_supported_type(&private_key)
            .map_err(|e| CaError::InvalidLeaf(e.to_string()))?;

        Ok(CertifiedKey::new(cert_chain, signing_key))
    }
}

/// Read the notAfter bound out of the stored CA certificate.
fn parse_not_after(cert_pem: &str) -> Result<OffsetDateTime, CaError> {
    let (_, pem) = x509_parser::pem::parse_x509_pem(cert_pem.as_bytes())
        .map_err(|e| CaError::Parse(e.to_string()))?;
    let cert = pem
        .parse_x509()
        .map_err(|e| CaError::Parse(e.to_string()))?;
    let ts = cert.validity().not_after.timestamp();
    OffsetDateTime::from_unix_timestamp(ts).map_err(|e| CaError::Parse(e.to_string()))
}

/// Write a file atomically (temp file, fsync, rename) with mode 0600.
fn write_atomic(path: &Path, content: &[u8]) -> Result<(), CaError> {
    let dir = path.parent().unwrap_or_else(|| Path::new("."));
    let wrap = |source: std::io::Error| CaError::WriteFile {
        path: path.to_path_buf(),
        source,
    };

    let mut tmp = tempfile::NamedTempFile::new_in(dir).map_err(wrap)?;
    tmp.write_all(content).map_err(wrap)?;
    tmp.as_file().sync_all().map_err(wrap)?;
    tmp.as_file()
        .set_permissions(fs::Permissions::from_mode(0o600))
        .map_err(wrap)?;
    tmp.persist(path).map_err(|e| wrap(e.error))?;
    Ok(())
}
