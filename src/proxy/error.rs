//! Error types for the filtering proxy.

use std::path::PathBuf;
use thiserror::Error;

/// Unified error type for proxy operations.
#[derive(Debug, Error)]
pub enum ProxyError {
    /// I/O error (socket operations, file access).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Hyper HTTP error.
    #[error("HTTP error: {0}")]
    Http(#[from] hyper::Error),

    /// CA load or minting failure. Fatal at construction time.
    #[error("CA error: {0}")]
    Ca(#[from] CaError),

    /// No free port in the retry window.
    #[error("no free port in {first}-{last} (all in use)")]
    PortExhausted {
        /// First port tried.
        first: u16,
        /// Last port tried.
        last: u16,
    },

    /// `start` was called while the server is already running.
    #[error("proxy server already running")]
    AlreadyRunning,

    /// Request is not a valid proxy request.
    #[error("invalid proxy request: {0}")]
    InvalidRequest(String),

    /// The filter configuration is invalid. Fatal at construction time.
    #[error("filter error: {0}")]
    Filter(#[from] crate::proxy::filter::FilterError),

    /// TLS error during handshake or certificate operations.
    #[error("TLS error: {0}")]
    Tls(String),

    /// Failed to connect to the upstream server.
    #[error("failed to connect to upstream '{addr}': {message}")]
    UpstreamConnect {
        /// The address we tried to connect to.
        addr: String,
        /// Error message.
        message: String,
    },

    /// A configured credential could not be loaded.
    #[error("credential '{label}': {message}")]
    Credential {
        /// Credential label from the config.
        label: String,
        /// Description of the failure.
        message: String,
    },

    /// Request log sink failure at construction time.
    #[error("request log error: {0}")]
    LogSink(std::io::Error),
}

/// Errors from the per-sandbox certificate authority.
#[derive(Debug, Error)]
pub enum CaError {
    /// Failed to read a CA file from the sandbox root.
    #[error("failed to read {path}: {source}")]
    ReadFile {
        /// Path that could not be read.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Failed to persist a CA file.
    #[error("failed to write {path}: {source}")]
    WriteFile {
        /// Path that could not be written.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// Stored CA material could not be parsed.
    #[error("failed to parse stored CA: {0}")]
    Parse(String),

    /// Key generation failed.
    #[error("failed to generate key pair: {0}")]
    KeyGeneration(String),

    /// Certificate generation or signing failed.
    #[error("failed to generate certificate: {0}")]
    CertGeneration(String),

    /// Minted leaf could not be converted into a TLS server key.
    #[error("failed to build TLS key from leaf: {0}")]
    InvalidLeaf(String),
}

impl From<rustls::Error> for ProxyError {
    fn from(err: rustls::Error) -> Self {
        ProxyError::Tls(err.to_string())
    }
}
