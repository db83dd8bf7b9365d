//! Size-rotated, gzip-compressed log files.
//!
//! The writer owns one open compressed stream. When a write would push the
//! current file past `max_size`, the stream is finished and a new file is
//! opened before the write. After every rotation, the oldest matching files
//! are pruned until at most `max_files` remain on disk.
//!
//! File name pattern: `<prefix>_<YYYYMMDD>_<NNNN><suffix>`, where `NNNN` is
//! one past the highest index already present for today.
//!
//! The compression buffer is flushed after every write so a crash loses at
//! most the final record.

use chrono::Local;
use flate2::write::GzEncoder;
use flate2::Compression;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Default rotation threshold (10 MiB of compressed output).
pub const DEFAULT_MAX_SIZE: u64 = 10 * 1024 * 1024;

/// Default retention count.
pub const DEFAULT_MAX_FILES: usize = 10;

/// Configuration for a [`RotatingFileWriter`].
#[derive(Debug, Clone)]
pub struct RotatingFileConfig {
    /// Directory the files live in. Created if missing.
    pub dir: PathBuf,
    /// File name prefix, e.g. `requests`.
    pub prefix: String,
    /// File name suffix, e.g. `.jsonl.gz`.
    pub suffix: String,
    /// Rotation threshold in bytes.
    pub max_size: u64,
    /// Maximum number of files kept on disk.
    pub max_files: usize,
}

impl RotatingFileConfig {
    /// Config with the default size and retention limits.
    pub fn new(dir: PathBuf, prefix: &str, suffix: &str) -> Self {
        Self {
            dir,
            prefix: prefix.to_string(),
            suffix: suffix.to_string(),
            max_size: DEFAULT_MAX_SIZE,
            max_files: DEFAULT_MAX_FILES,
        }
    }
}

/// Line-oriented writer over a rotating set of gzip files.
pub struct RotatingFileWriter {
    config: RotatingFileConfig,
    encoder: Option<GzEncoder<File>>,
    written: u64,
}

impl RotatingFileWriter {
    /// Create the writer and open the first output file.
    pub fn new(config: RotatingFileConfig) -> io::Result<Self> {
        fs::create_dir_all(&config.dir)?;
        let mut writer = Self {
            config,
            encoder: None,
            written: 0,
        };
        writer.rotate()?;
        Ok(writer)
    }

    /// Append `buf` to the active file, rotating first if it would exceed
    /// the size limit. Returns the number of bytes accepted (always the full
    /// buffer on success).
    pub fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        if self.encoder.is_none() {
            return Err(io::Error::new(io::ErrorKind::Other, "writer is closed"));
        }

        if self.written + buf.len() as u64 > self.config.max_size {
            self.rotate()?;
        }

        let encoder = self.encoder.as_mut().expect("rotate leaves an open encoder");
        encoder.write_all(buf)?;
        encoder.flush()?;
        self.written += buf.len() as u64;
        Ok(buf.len())
    }

    /// Flush and close the active file. Subsequent writes fail.
    pub fn close(&mut self) -> io::Result<()> {
        if let Some(encoder) = self.encoder.take() {
            let file = encoder.finish()?;
            file.sync_all()?;
        }
        Ok(())
    }

    fn rotate(&mut self) -> io::Result<()> {
        if let Some(encoder) = self.encoder.take() {
            encoder.finish()?;
        }

        let date = Local::now().format("%Y%m%d").to_string();
        let index = self.next_index(&date);
        let name = format!(
            "{}_{}_{:04}{}",
            self.config.prefix, date, index, self.config.suffix
        );
        let path = self.config.dir.join(name);
        debug!("Opening log file {:?}", path);

        let file = File::options().create(true).append(true).open(&path)?;
        self.encoder = Some(GzEncoder::new(file, Compression::default()));
        self.written = 0;

        self.prune();
        Ok(())
    }

    /// One past the highest index already used today, starting at 1.
    fn next_index(&self, date: &str) -> u32 {
        let stem = format!("{}_{}_", self.config.prefix, date);
        let max = self
            .matching_files()
            .into_iter()
            .filter_map(|p| {
                let name = p.file_name()?.to_str()?.to_string();
                let rest = name.strip_prefix(&stem)?;
                let digits = rest.strip_suffix(&self.config.suffix)?;
                digits.parse::<u32>().ok()
            })
            .max()
            .unwrap_or(0);
        max + 1
    }

    /// Remove the oldest matching files until at most `max_files` remain.
    /// Failures here never fail a write.
    fn prune(&self) {
        let mut files = self.matching_files();
        if files.len() <= self.config.max_files {
            return;
        }

        files.sort_by_key(|p| {
            fs::metadata(p)
                .and_then(|m| m.modified())
                .unwrap_or(std::time::SystemTime::UNIX_EPOCH)
        });

        let excess = files.len() - self.config.max_files;
        for path in files.into_iter().take(excess) {
            if let Err(e) = fs::remove_file(&path) {
                warn!("Failed to prune old log file {:?}: {}", path, e);
            } else {
                debug!("Pruned old log file {:?}", path);
            }
        }
    }

    fn matching_files(&self) -> Vec<PathBuf> {
        let stem = format!("{}_", self.config.prefix);
        let Ok(entries) = fs::read_dir(&self.config.dir) else {
            return Vec::new();
        };
        entries
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| {
                p.file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| n.starts_with(&stem) && n.ends_with(&self.config.suffix))
                    .unwrap_or(false)
            })
            .collect()
    }
}

impl Drop for RotatingFileWriter {
    fn drop(&mut self) {
        let _ = self.close();
    }
}

/// Decompress every matching file in `dir` (oldest first) and return the
/// concatenated content. Used by log readers and tests.
pub fn read_all(dir: &Path, prefix: &str, suffix: &str) -> io::Result<Vec<u8>> {
    use flate2::read::GzDecoder;
    use std::io::Read;

    let stem = format!("{prefix}_");
    let mut files: Vec<PathBuf> = fs::read_dir(dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| {
            p.file_name()
                .and_then(|n| n.to_str())
                .map(|n| n.starts_with(&stem) && n.ends_with(suffix))
                .unwrap_or(false)
        })
        .collect();
    files.sort();

    let mut out = Vec::new();
    for path in files {
        let mut decoder = GzDecoder::new(File::open(path)?);
        decoder.read_to_end(&mut out)?;
    }
    Ok(out)
}
