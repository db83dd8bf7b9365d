//! Builder for the bwrap argument vector.
//!
//! The builder produces arguments only; execution is the composer's job,
//! because proxy mode hands the vector to the network driver instead of
//! exec'ing bwrap directly.

use std::ffi::OsString;
use std::path::Path;

/// Builder for a bwrap invocation.
#[derive(Debug, Default)]
pub struct BwrapBuilder {
    args: Vec<OsString>,
}

impl BwrapBuilder {
    /// Empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a raw argument.
    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Start from an empty environment.
    pub fn clear_env(self) -> Self {
        self.arg("--clearenv")
    }

    /// New user namespace.
    pub fn unshare_user(self) -> Self {
        self.arg("--unshare-user")
    }

    /// New PID namespace.
    pub fn unshare_pid(self) -> Self {
        self.arg("--unshare-pid")
    }

    /// Kill the sandbox when the parent dies.
    pub fn die_with_parent(self) -> Self {
        self.arg("--die-with-parent")
    }

    /// Mount a fresh /proc.
    pub fn proc(self, dest: &Path) -> Self {
        self.arg("--proc").arg(dest)
    }

    /// Mount a minimal /dev.
    pub fn dev(self, dest: &Path) -> Self {
        self.arg("--dev").arg(dest)
    }

    /// Mount a tmpfs at `dest`. Also used to shadow blocked directories.
    pub fn tmpfs(self, dest: &Path) -> Self {
        self.arg("--tmpfs").arg(dest)
    }

    /// Read-only bind mount.
    pub fn ro_bind(self, src: &Path, dest: &Path) -> Self {
        self.arg("--ro-bind").arg(src).arg(dest)
    }

    /// Read-only bind mount, skipped if the source is missing.
    pub fn ro_bind_try(self, src: &Path, dest: &Path) -> Self {
        self.arg("--ro-bind-try").arg(src).arg(dest)
    }

    /// Read-write bind mount.
    pub fn bind(self, src: &Path, dest: &Path) -> Self {
        self.arg("--bind").arg(src).arg(dest)
    }

    /// Create a symlink inside the sandbox.
    pub fn symlink(self, target: &str, link: &Path) -> Self {
        self.arg("--symlink").arg(target).arg(link)
    }

    /// Create an empty directory inside the sandbox.
    pub fn dir(self, dest: &Path) -> Self {
        self.arg("--dir").arg(dest)
    }

    /// Set the in-sandbox uid/gid.
    pub fn uid_gid(self, uid: u32, gid: u32) -> Self {
        self.arg("--uid")
            .arg(uid.to_string())
            .arg("--gid")
            .arg(gid.to_string())
    }

    /// Set an environment variable inside the sandbox.
    pub fn setenv(self, key: &str, value: &str) -> Self {
        self.arg("--setenv").arg(key).arg(value)
    }

    /// Working directory inside the sandbox.
    pub fn chdir(self, path: &Path) -> Self {
        self.arg("--chdir").arg(path)
    }

    /// Finish and return the argument vector (without the `bwrap` argv0 and
    /// without the trailing `-- command`).
    pub fn build(self) -> Vec<OsString> {
        self.args
    }
}
