//! Error types for sandbox composition.

use std::path::PathBuf;
use thiserror::Error;

/// Unified error type for sandbox operations.
#[derive(Debug, Error)]
pub enum SandboxError {
    /// Bubblewrap is not installed on the host.
    #[error("bubblewrap (bwrap) is not installed\nInstall with: sudo apt install bubblewrap")]
    BwrapMissing,

    /// A required (non-optional) binding source is missing.
    #[error("required binding source does not exist: {path}")]
    BindingSourceMissing {
        /// The missing source path.
        path: PathBuf,
    },

    /// Sandbox directories could not be created.
    #[error("failed to create sandbox directory {path}: {source}")]
    CreateDir {
        /// The directory that could not be created.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The session lock could not be acquired.
    #[error("session lock error: {0}")]
    Lock(#[from] LockError),

    /// Handing off to the sandbox primitive failed.
    #[error("failed to execute bwrap: {0}")]
    Exec(#[source] std::io::Error),

    /// Home directory could not be determined.
    #[error("could not determine home directory")]
    NoHomeDirectory,

    /// Generic process error.
    #[error("sandbox process error: {0}")]
    Process(#[from] std::io::Error),
}

/// Errors from the advisory session lock.
#[derive(Debug, Error)]
pub enum LockError {
    /// The lock file could not be opened or created.
    #[error("failed to open lock file {path}: {source}")]
    Open {
        /// The lock file path.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },

    /// The flock call failed.
    #[error("failed to acquire lock on {path}: {errno}")]
    Acquire {
        /// The lock file path.
        path: PathBuf,
        /// The errno from flock.
        errno: nix::errno::Errno,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn binding_source_missing_names_path() {
        let err = SandboxError::BindingSourceMissing {
            path: PathBuf::from("/home/user/.gitconfig"),
        };
        assert!(err.to_string().contains("/home/user/.gitconfig"));
    }

    #[test]
    fn lock_error_converts() {
        let err: SandboxError = LockError::Acquire {
            path: PathBuf::from("/x/.lock"),
            errno: nix::errno::Errno::EWOULDBLOCK,
        }
        .into();
        assert!(matches!(err, SandboxError::Lock(_)));
    }
}
