//! Advisory session lock.
//!
//! Sessions hold a *shared* flock on `<root>/.lock` for their lifetime, so
//! any number of concurrent sessions coexist. "Is anyone active?" is
//! probed by attempting a non-blocking *exclusive* lock: success means no
//! holder (the probe releases immediately), failure means at least one
//! session is live. The lock is advisory only; it promises nothing about
//! sandbox contents.

use super::error::LockError;
use nix::fcntl::{Flock, FlockArg};
use std::fs::{File, OpenOptions};
use std::path::Path;

/// File name of the session lock inside a sandbox root.
pub const LOCK_FILE_NAME: &str = ".lock";

/// A held session lock. Dropping it releases the lock.
pub struct SessionLock {
    _lock: Flock<File>,
}

/// Acquire a shared session lock on the sandbox. The returned guard must
/// be kept alive for the duration of the session.
pub fn acquire_session_lock(sandbox_root: &Path) -> Result<SessionLock, LockError> {
    let path = sandbox_root.join(LOCK_FILE_NAME);
    let file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .truncate(false)
        .open(&path)
        .map_err(|source| LockError::Open {
            path: path.clone(),
            source,
        })?;

    let lock = Flock::lock(file, FlockArg::LockSharedNonblock)
        .map_err(|(_, errno)| LockError::Acquire { path, errno })?;

    Ok(SessionLock { _lock: lock })
}

/// Whether any session currently holds the lock.
pub fn is_session_active(sandbox_root: &Path) -> bool {
    let path = sandbox_root.join(LOCK_FILE_NAME);
    let Ok(file) = OpenOptions::new().read(true).write(true).open(&path) else {
        // Missing or unopenable lock file: nothing is active.
        return false;
    };

    // An exclusive probe fails iff someone holds the shared lock.
    match Flock::lock(file, FlockArg::LockExclusiveNonblock) {
        Ok(probe) => {
            drop(probe);
            false
        }
        Err(_) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_lock_file_means_inactive() {
        let root = tempfile::tempdir().unwrap();
        assert!(!is_session_active(root.path()));
    }

    #[test]
    fn held_lock_marks_session_active() {
        let root = tempfile::tempdir().unwrap();

        let guard = acquire_session_lock(root.path()).unwrap();
        assert!(is_session_active(root.path()));

        drop(guard);
        assert!(!is_session_active(root.path()));
    }

    #[test]
    fn shared_locks_coexist() {
        let root = tempfile::tempdir().unwrap();

        let first = acquire_session_lock(root.path()).unwrap();
        let second = acquire_session_lock(root.path()).unwrap();
        assert!(is_session_active(root.path()));

        drop(first);
        // One holder remains.
        assert!(is_session_active(root.path()));

        drop(second);
        assert!(!is_session_active(root.path()));
    }

    #[test]
    fn probe_does_not_keep_the_lock() {
        let root = tempfile::tempdir().unwrap();

        assert!(!is_session_active(root.path()));
        // The probe released: a fresh session can still acquire.
        let _guard = acquire_session_lock(root.path()).unwrap();
        assert!(is_session_active(root.path()));
    }
}
