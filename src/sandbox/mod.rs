//! Per-project sandbox: identity, metadata, locking, and composition.
//!
//! The lifecycle at startup:
//!
//! 1. resolve the project's stable identity ([`identity`])
//! 2. create the sandbox directory tree and touch metadata ([`metadata`])
//! 3. acquire the shared session lock ([`lock`])
//! 4. run adapter setup hooks, then assemble the bwrap argument vector
//!    ([`composer`], [`builder`])
//! 5. exec the sandbox primitive, or in proxy mode hand the vector to
//!    the network driver so this process stays alive to run the proxy
//!
//! The sandbox interior is untrusted. Everything that must stay hidden
//! (key material, cloud credentials, `.env` files) is overlaid *after*
//! adapter contributions; see [`composer::BLOCKED_HOME_DIRS`].

pub mod builder;
pub mod composer;
pub mod error;
pub mod identity;
pub mod lock;
pub mod metadata;
pub mod shell;

pub use builder::BwrapBuilder;
pub use composer::{
    check_bwrap_installed, exec_bwrap, Composer, Composition, ProxyEndpoint,
    BLOCKED_HOME_DIRS, BLOCKED_PROJECT_FILES, SANDBOX_CA_MOUNT_PATH,
};
pub use error::{LockError, SandboxError};
pub use identity::{
    find_existing_sandbox, generate_sandbox_name, sanitize_project_name, SandboxIdentity,
    SandboxPaths, SANDBOX_BASE_DIR,
};
pub use lock::{acquire_session_lock, is_session_active, SessionLock};
pub use metadata::{SandboxMetadata, METADATA_FILE};
pub use shell::{build_shell_command, detect_shell, Shell};
