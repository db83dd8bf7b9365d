//! TLS-intercepting filtering proxy.
//!
//! When proxy mode is on, all sandbox traffic is forced through this
//! in-process server:
//!
//! ```text
//! ┌──────────────────────────────────────────────┐
//! │          Sandbox (pasta network ns)          │
//! │   tool ──► HTTP(S)_PROXY=10.0.2.2:<port> ──┐ │
//! └────────────────────────────────────────────┼─┘
//!                                              │ (host loopback)
//!                                     ┌────────▼────────┐
//!                                     │   ProxyServer   │
//!                                     │ filter / inject │
//!                                     │ CA-minted leafs │
//!                                     │  request log    │
//!                                     └────────┬────────┘
//!                                              ▼
//!                                          Internet
//! ```
//!
//! Submodules map onto the pipeline: [`ca`] mints leafs, [`filter`]
//! decides, [`credentials`] attaches secrets, [`reqlog`] + [`rotating`]
//! persist the audit trail, [`tls`] holds both handshake directions, and
//! [`server`] wires them around each transaction.

pub mod ca;
pub mod credentials;
pub mod error;
pub mod filter;
pub mod reqlog;
pub mod rotating;
pub mod server;
pub mod tls;

pub use ca::CertificateAuthority;
pub use credentials::{CredentialInjector, CredentialRecipe};
pub use error::{CaError, ProxyError};
pub use filter::{
    AskPrompt, Asker, FilterAction, FilterConfig, FilterDecision, FilterEngine, FilterRule,
    FilterScope, PatternType,
};
pub use reqlog::{RequestLogger, RequestRecord};
pub use rotating::{RotatingFileConfig, RotatingFileWriter};
pub use server::{ProxyConfig, ProxyServer, MAX_PORT_RETRIES};
