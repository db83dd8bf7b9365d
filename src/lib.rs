//! devsandbox: per-project development sandbox with a filtering proxy
//!
//! Untrusted developer tools (build systems, package managers, AI coding
//! assistants) run inside two enforced isolation layers:
//!
//! - a filesystem and process-namespace jail (Bubblewrap) that hides
//!   credentials and system state while exposing a writable project tree
//!   and a private per-project HOME
//! - an optional network-isolation mode (pasta) in which all traffic is
//!   forced through an in-process HTTPS-intercepting proxy that filters,
//!   injects credentials, and logs every request
//!
//! # Architecture
//!
//! - **Sandbox**: stable project identity, session lock, and the composer
//!   that turns tool contributions into a bwrap argument vector
//! - **Proxy**: MITM server with a persistent per-sandbox CA, rule-based
//!   filter, credential injector, and rotating compressed request log
//! - **Tools**: adapter registry contributing mounts/env/setup per tool
//! - **Network**: pasta driver mapping a fabricated gateway to loopback
//! - **Config**: hierarchical TOML configuration

#![warn(clippy::all)]
#![warn(missing_docs)]

pub mod cli;
pub mod config;
pub mod network;
pub mod proxy;
pub mod sandbox;
pub mod tools;
