//! Per-sandbox metadata file.
//!
//! `metadata.json` records which project a sandbox directory belongs to.
//! It is what lets a renamed project keep its sandbox, and what the
//! listing tooling reads. The last-used timestamp is best-effort.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

/// File name of the metadata file inside a sandbox root.
pub const METADATA_FILE: &str = "metadata.json";

/// Metadata persisted in each sandbox root.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SandboxMetadata {
    /// The real project path this sandbox belongs to.
    pub project_dir: PathBuf,
    /// The sandbox directory name.
    pub project_name: String,
    /// When the sandbox was first created.
    pub created_at: DateTime<Utc>,
    /// When the sandbox was last used.
    pub last_used_at: DateTime<Utc>,
}

impl SandboxMetadata {
    /// Fresh metadata for a new sandbox.
    pub fn new(project_dir: &Path, project_name: &str) -> Self {
        let now = Utc::now();
        Self {
            project_dir: project_dir.to_path_buf(),
            project_name: project_name.to_string(),
            created_at: now,
            last_used_at: now,
        }
    }

    /// Load metadata from a sandbox root.
    pub fn load(sandbox_root: &Path) -> io::Result<Self> {
        let content = fs::read_to_string(sandbox_root.join(METADATA_FILE))?;
        serde_json::from_str(&content).map_err(io::Error::other)
    }

    /// Save metadata into a sandbox root.
    pub fn save(&self, sandbox_root: &Path) -> io::Result<()> {
        let content = serde_json::to_string_pretty(self).map_err(io::Error::other)?;
        fs::write(sandbox_root.join(METADATA_FILE), content)
    }

    /// Create metadata if absent, otherwise bump the last-used timestamp.
    /// Failures are ignored; the timestamp is advisory.
    pub fn create_or_touch(sandbox_root: &Path, project_dir: &Path, project_name: &str) {
        match Self::load(sandbox_root) {
            Ok(mut meta) => {
                meta.last_used_at = Utc::now();
                let _ = meta.save(sandbox_root);
            }
            Err(_) => {
                let _ = Self::new(project_dir, project_name).save(sandbox_root);
            }
        }
    }
}
