//! Advisory lock on the admission state file.
//!
//! Cross-process mutual exclusion for [`crate::admission::AdmissionController`].
//! Acquisition is bounded by `lockWaitMs`; on timeout the caller must deny
//! fail-closed rather than proceed unlocked. A lock file older than
//! `lockStaleMs` is assumed abandoned by a crashed owner and reclaimed.

use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use fs2::FileExt;

use crate::error::{Error, Result};

/// A held advisory lock. Released (best-effort) on drop.
pub struct LockGuard {
    file: File,
    path: PathBuf,
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
        let _ = std::fs::remove_file(&self.path);
    }
}

/// Acquire the advisory lock at `path`, waiting up to `wait` and reclaiming
/// a stale lock older than `stale`.
pub fn acquire(path: &Path, wait: Duration, stale: Duration) -> Result<LockGuard> {
    reclaim_if_stale(path, stale)?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    let file = OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(false)
        .open(path)?;

    let deadline = Instant::now() + wait;
    loop {
        match file.try_lock_exclusive() {
            Ok(()) => {
                write_owner_marker(&file)?;
                return Ok(LockGuard {
                    file,
                    path: path.to_path_buf(),
                });
            }
            Err(_) if Instant::now() >= deadline => {
                return Err(Error::LockTimeout {
                    path: path.to_path_buf(),
                    waited_ms: wait.as_millis() as u64,
                });
            }
            Err(_) => std::thread::sleep(Duration::from_millis(20)),
        }
    }
}

fn write_owner_marker(file: &File) -> Result<()> {
    let mut file = file;
    file.set_len(0)?;
    let now_ms = now_epoch_ms();
    writeln!(file, "{}:{now_ms}", std::process::id())?;
    Ok(())
}

/// A lock file is only reclaimed once it is *both* stale by mtime age and
/// its owning PID (recorded by `write_owner_marker`) is confirmed dead.
/// Age alone would let a long-running supervised child that never touches
/// the lock file get its lock stolen out from under it.
fn reclaim_if_stale(path: &Path, stale: Duration) -> Result<()> {
    let Ok(meta) = std::fs::metadata(path) else {
        return Ok(());
    };
    let Ok(modified) = meta.modified() else {
        return Ok(());
    };
    let age = SystemTime::now()
        .duration_since(modified)
        .unwrap_or(Duration::ZERO);
    if age > stale && !owner_is_alive(path) {
        let _ = std::fs::remove_file(path);
    }
    Ok(())
}

/// Read back the `pid:timestamp` marker `write_owner_marker` wrote and
/// check liveness with `kill -0`, since `unsafe_code` is forbidden
/// workspace-wide (same shelling-out convention as `supervisor::send_sigterm`).
/// An unreadable or malformed marker carries no liveness signal to trust, so
/// it is treated as "owner not alive."
fn owner_is_alive(path: &Path) -> bool {
    let Ok(contents) = std::fs::read_to_string(path) else {
        return false;
    };
    let Some(pid) = contents.trim().split(':').next().and_then(|s| s.parse::<u32>().ok()) else {
        return false;
    };

    std::process::Command::new("kill")
        .arg("-0")
        .arg(pid.to_string())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .is_ok_and(|status| status.success())
}

fn now_epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_times_out_while_first_is_held() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("admission.lock");
        let _first = acquire(&path, Duration::from_millis(200), Duration::from_secs(60)).unwrap();
        let second = acquire(&path, Duration::from_millis(50), Duration::from_secs(60));
        assert!(matches!(second, Err(Error::LockTimeout { .. })));
    }

    #[test]
    fn lock_released_on_drop_allows_next_acquire() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("admission.lock");
        {
            let _guard = acquire(&path, Duration::from_millis(200), Duration::from_secs(60)).unwrap();
        }
        let again = acquire(&path, Duration::from_millis(200), Duration::from_secs(60));
        assert!(again.is_ok());
    }

    #[test]
    fn stale_lock_is_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("admission.lock");
        std::fs::write(&path, "99999999:0").unwrap();
        // A zero staleness threshold treats any existing lock file as stale,
        // and PID 99999999 is not a real process, so it's reclaimable.
        let acquired = acquire(&path, Duration::from_millis(200), Duration::from_millis(0));
        assert!(acquired.is_ok());
    }

    #[test]
    fn stale_by_age_lock_is_kept_while_owner_pid_is_alive() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("admission.lock");
        std::fs::write(&path, format!("{}:0", std::process::id())).unwrap();
        // A zero staleness threshold alone would call this stale, but the
        // marker's PID is this very test process, which is alive.
        reclaim_if_stale(&path, Duration::from_millis(0)).unwrap();
        assert!(path.exists());
    }

    #[test]
    fn unreadable_marker_counts_as_owner_not_alive() {
        assert!(!owner_is_alive(Path::new("/nonexistent/admission.lock")));
    }
}
