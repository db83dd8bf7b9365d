//! Stable per-project sandbox identity and on-disk layout.
//!
//! A sandbox is named `<basename>-<hash8>` where `hash8` is the first
//! eight hex characters of the SHA-256 of the full project path. The name
//! is stable across runs and distinct for different paths sharing a
//! basename. Renamed or legacy sandboxes are found by scanning metadata
//! files for a matching `project_dir` before a new name is generated.

use super::metadata::SandboxMetadata;
use sha2::{Digest, Sha256};
use std::fs;
use std::path::{Path, PathBuf};

/// Directory under `~/.local/share` holding all sandboxes.
pub const SANDBOX_BASE_DIR: &str = "devsandbox";

/// Replace every character outside `[A-Za-z0-9._-]` with `_`.
pub fn sanitize_project_name(name: &str) -> String {
    name.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-') {
                c
            } else {
                '_'
            }
        })
        .collect()
}

/// Derive the unique sandbox name for a project path.
pub fn generate_sandbox_name(project_dir: &Path) -> String {
    let basename = project_dir
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| "project".to_string());

    let digest = Sha256::digest(project_dir.as_os_str().as_encoded_bytes());
    let short_hash = &hex::encode(digest)[..8];

    format!("{}-{}", sanitize_project_name(&basename), short_hash)
}

/// Find an existing sandbox whose metadata points at `project_dir`.
pub fn find_existing_sandbox(base_dir: &Path, project_dir: &Path) -> Option<String> {
    let entries = fs::read_dir(base_dir).ok()?;
    for entry in entries.filter_map(|e| e.ok()) {
        if !entry.file_type().map(|t| t.is_dir()).unwrap_or(false) {
            continue;
        }
        let root = entry.path();
        if let Ok(meta) = SandboxMetadata::load(&root) {
            if meta.project_dir == project_dir {
                return Some(entry.file_name().to_string_lossy().into_owned());
            }
        }
    }
    None
}

/// Resolved identity of one project's sandbox.
#[derive(Debug, Clone)]
pub struct SandboxIdentity {
    /// Absolute path of the project directory.
    pub project_dir: PathBuf,
    /// Stable sandbox name.
    pub project_name: String,
}

impl SandboxIdentity {
    /// Resolve the identity for `project_dir`, reusing a legacy sandbox
    /// directory when its metadata matches.
    pub fn resolve(base_dir: &Path, project_dir: &Path) -> Self {
        let project_name = find_existing_sandbox(base_dir, project_dir)
            .unwrap_or_else(|| generate_sandbox_name(project_dir));
        Self {
            project_dir: project_dir.to_path_buf(),
            project_name,
        }
    }
}

/// On-disk layout of one sandbox.
#[derive(Debug, Clone)]
pub struct SandboxPaths {
    /// `~/.local/share/devsandbox/<project_name>`.
    pub root: PathBuf,
    /// Sandbox HOME, mounted over the real home path inside the sandbox.
    pub home: PathBuf,
    /// Rotating request logs.
    pub proxy_logs: PathBuf,
    /// Internal diagnostics.
    pub internal_logs: PathBuf,
    /// Persisted CA certificate.
    pub ca_cert: PathBuf,
    /// Persisted CA private key.
    pub ca_key: PathBuf,
    /// Session lock file.
    pub lock_file: PathBuf,
}

impl SandboxPaths {
    /// Layout for a sandbox named `project_name` under `base_dir`.
    pub fn new(base_dir: &Path, project_name: &str) -> Self {
        let root = base_dir.join(project_name);
        Self {
            home: root.join("home"),
            proxy_logs: root.join("logs").join("proxy"),
            internal_logs: root.join("logs").join("internal"),
            ca_cert: root.join("ca.crt"),
            ca_key: root.join("ca.key"),
            lock_file: root.join(".lock"),
            root,
        }
    }

    /// The default base directory: `~/.local/share/devsandbox`.
    pub fn default_base_dir(home_dir: &Path) -> PathBuf {
        home_dir.join(".local").join("share").join(SANDBOX_BASE_DIR)
    }

    /// Create the sandbox root, the home subtree (XDG dirs plus language
    /// build caches), and the log directories. Idempotent.
    pub fn ensure_dirs(&self) -> Result<(), super::error::SandboxError> {
        let dirs = [
            self.home.clone(),
            self.home.join(".config"),
            self.home.join(".cache"),
            self.home.join(".cache").join("go-build"),
            self.home.join(".cache").join("go-mod"),
            self.home.join(".local").join("share"),
            self.home.join(".local").join("state"),
            self.home.join("go"),
            self.proxy_logs.clone(),
            self.internal_logs.clone(),
        ];
        for dir in dirs {
            fs::create_dir_all(&dir).map_err(|source| super::error::SandboxError::CreateDir {
                path: dir.clone(),
                source,
            })?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Utc;

    #[test]
    fn sanitize_replaces_special_characters() {
        assert_eq!(sanitize_project_name("my-project_1.0"), "my-project_1.0");
        assert_eq!(sanitize_project_name("my project!"), "my_project_");
        assert_eq!(sanitize_project_name("a/b:c"), "a_b_c");
        assert_eq!(sanitize_project_name("日本語"), "___");
    }

    #[test]
    fn name_is_deterministic() {
        let dir = Path::new("/home/dev/myproject");
        assert_eq!(generate_sandbox_name(dir), generate_sandbox_name(dir));
    }

    #[test]
    fn name_has_basename_and_hash() {
        let name = generate_sandbox_name(Path::new("/home/dev/myproject"));
        assert!(name.starts_with("myproject-"));
        let hash = name.strip_prefix("myproject-").unwrap();
        assert_eq!(hash.len(), 8);
        assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn same_basename_different_paths_differ() {
        let a = generate_sandbox_name(Path::new("/home/alice/app"));
        let b = generate_sandbox_name(Path::new("/home/bob/app"));
        assert_ne!(a, b);
        assert!(a.starts_with("app-"));
        assert!(b.starts_with("app-"));
    }

    #[test]
    fn resolve_generates_when_no_metadata() {
        let base = tempfile::tempdir().unwrap();
        let identity =
            SandboxIdentity::resolve(base.path(), Path::new("/home/dev/fresh"));
        assert!(identity.project_name.starts_with("fresh-"));
    }

    #[test]
    fn resolve_reuses_legacy_sandbox() {
        let base = tempfile::tempdir().unwrap();
        let legacy_root = base.path().join("oldname");
        fs::create_dir_all(&legacy_root).unwrap();

        let meta = SandboxMetadata {
            project_dir: PathBuf::from("/home/dev/renamed"),
            project_name: "oldname".to_string(),
            created_at: Utc::now(),
            last_used_at: Utc::now(),
        };
        meta.save(&legacy_root).unwrap();

        let identity =
            SandboxIdentity::resolve(base.path(), Path::new("/home/dev/renamed"));
        assert_eq!(identity.project_name, "oldname");
    }

    #[test]
    fn paths_layout() {
        let paths = SandboxPaths::new(Path::new("/data/devsandbox"), "proj-abcd1234");
        assert_eq!(
            paths.root,
            Path::new("/data/devsandbox/proj-abcd1234")
        );
        assert_eq!(paths.home, paths.root.join("home"));
        assert_eq!(paths.ca_cert, paths.root.join("ca.crt"));
        assert_eq!(paths.lock_file, paths.root.join(".lock"));
        assert!(paths.proxy_logs.ends_with("logs/proxy"));
    }

    #[test]
    fn ensure_dirs_creates_home_subtree() {
        let base = tempfile::tempdir().unwrap();
        let paths = SandboxPaths::new(base.path(), "p-00000000");
        paths.ensure_dirs().unwrap();

        assert!(paths.home.join(".config").is_dir());
        assert!(paths.home.join(".local/state").is_dir());
        assert!(paths.proxy_logs.is_dir());

        // Idempotent.
        paths.ensure_dirs().unwrap();
    }
}
