//! Bounded, size-rotated NDJSON log writer (§4.6).
//!
//! Appends are throttled by `checkIntervalMs`: the rotation check (a stat
//! call) only happens when that much time has passed since the last check,
//! not on every append. Rotation renames `file.(i-1) -> file.i` down to
//! `maxBackups` and tolerates missing intermediate files. A write failure
//! here must never fail the caller's primary operation — callers log a
//! `tracing::warn!` and move on.

use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use serde::Serialize;

/// Append-only NDJSON writer with size-based backup rotation.
pub struct BoundedLogWriter {
    path: PathBuf,
    max_bytes: u64,
    max_backups: u32,
    check_interval: Duration,
    last_check: Option<Instant>,
}

impl BoundedLogWriter {
    #[must_use]
    pub fn new(path: PathBuf, max_bytes: u64, max_backups: u32, check_interval: Duration) -> Self {
        Self {
            path,
            max_bytes: max_bytes.clamp(64 * 1024, 1024 * 1024 * 1024),
            max_backups: max_backups.clamp(1, 20),
            check_interval,
            last_check: None,
        }
    }

    /// Serialize `event` as one NDJSON line and append it. Never returns an
    /// error to the caller's critical path; failures are logged and
    /// swallowed.
    pub fn append<T: Serialize>(&mut self, event: &T) {
        if let Err(err) = self.try_append(event) {
            tracing::warn!(error = %err, path = %self.path.display(), "event log append failed");
        }
    }

    fn try_append<T: Serialize>(&mut self, event: &T) -> std::io::Result<()> {
        self.maybe_rotate()?;

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }

        let mut line = serde_json::to_string(event).map_err(std::io::Error::other)?;
        line.push('\n');

        let mut file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        file.write_all(line.as_bytes())?;
        Ok(())
    }

    fn maybe_rotate(&mut self) -> std::io::Result<()> {
        let due = self
            .last_check
            .is_none_or(|t| t.elapsed() >= self.check_interval);
        if !due {
            return Ok(());
        }
        self.last_check = Some(Instant::now());

        let size = std::fs::metadata(&self.path).map(|m| m.len()).unwrap_or(0);
        if size < self.max_bytes {
            return Ok(());
        }
        rotate(&self.path, self.max_backups)
    }
}

/// Rename `path.(i-1) -> path.i` down to `max_backups`, oldest-first, then
/// free the base name for a fresh file. Missing intermediate files are
/// skipped rather than treated as an error.
fn rotate(path: &Path, max_backups: u32) -> std::io::Result<()> {
    let oldest = backup_path(path, max_backups);
    if oldest.exists() {
        std::fs::remove_file(&oldest)?;
    }

    for i in (1..max_backups).rev() {
        let from = backup_path(path, i);
        let to = backup_path(path, i + 1);
        if from.exists() {
            std::fs::rename(from, to)?;
        }
    }

    std::fs::rename(path, backup_path(path, 1))?;
    Ok(())
}

fn backup_path(path: &Path, index: u32) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(format!(".{index}"));
    PathBuf::from(name)
}
