//! Cross-process flavor locks.
//!
//! Any code that mutates a flavor directory (first-time fetch, partial load
//! merge, flavor materialization) holds the directory's `.lock` for the
//! duration. The lock is an OS advisory lock on the `.lock` file, so it
//! evaporates when a holder crashes; the file itself records the owning PID
//! so a stale-looking lock can be diagnosed, but it is never auto-removed.

use crate::error::{ErrorKind, Result};
use crate::tiers::LOCK_FILE;
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time::Instant;

const POLL_INTERVAL: Duration = Duration::from_millis(100);
/// Quietly retry this long before telling the user someone else holds the lock.
const WARN_AFTER: Duration = Duration::from_secs(2);
/// Abandon the operation after this long.
const GIVE_UP_AFTER: Duration = Duration::from_secs(24 * 60 * 60);

/// Exclusive lock over one flavor directory.
///
/// Released on drop. Holding the guard is the only correctness requirement;
/// the recorded PID is informational.
#[derive(Debug)]
pub struct FlavorLock {
    file: File,
    path: PathBuf,
}

impl FlavorLock {
    /// Acquire the lock for `flavor_dir`, creating the directory if needed.
    ///
    /// Polls the advisory lock on the default schedule: warn once after 2
    /// seconds, fail with [`ErrorKind::LockTimeout`] after 24 hours.
    pub async fn acquire(flavor_dir: &Path) -> Result<Self> {
        Self::acquire_with(flavor_dir, WARN_AFTER, GIVE_UP_AFTER).await
    }

    /// Acquire with an explicit retry schedule (tests shrink the deadline).
    pub async fn acquire_with(flavor_dir: &Path, warn_after: Duration, give_up_after: Duration) -> Result<Self> {
        std::fs::create_dir_all(flavor_dir).map_err(ErrorKind::Io)?;
        let path = flavor_dir.join(LOCK_FILE);
        let file = OpenOptions::new().create(true).truncate(false).write(true).open(&path).map_err(ErrorKind::Io)?;

        let started = Instant::now();
        let mut warned = false;
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => break,
                Err(_) if started.elapsed() >= give_up_after => {
                    exn::bail!(ErrorKind::LockTimeout(path));
                },
                Err(_) => {
                    if !warned && started.elapsed() >= warn_after {
                        warned = true;
                        tracing::warn!(
                            lock = %path.display(),
                            holder = read_holder(&path).as_deref().unwrap_or("unknown"),
                            "waiting for another process to release the cache lock",
                        );
                    }
                    tokio::time::sleep(POLL_INTERVAL).await;
                },
            }
        }

        let mut lock = Self { file, path };
        lock.record_holder();
        Ok(lock)
    }

    /// Path of the lock file.
    pub fn path(&self) -> &Path {
        &self.path
    }

    fn record_holder(&mut self) {
        // Best-effort diagnostics only; the advisory lock is authoritative.
        let acquired = time::OffsetDateTime::now_utc()
            .format(&time::format_description::well_known::Rfc3339)
            .unwrap_or_default();
        _ = self.file.set_len(0);
        _ = writeln!(self.file, "{}", std::process::id());
        _ = writeln!(self.file, "{acquired}");
        _ = self.file.flush();
    }
}

impl Drop for FlavorLock {
    fn drop(&mut self) {
        // The lock file stays behind; only the advisory lock is released.
        _ = fs2::FileExt::unlock(&self.file);
    }
}

fn read_holder(path: &Path) -> Option<String> {
    let raw = std::fs::read_to_string(path).ok()?;
    let pid = raw.lines().next().unwrap_or_default().trim();
    (!pid.is_empty()).then(|| pid.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_acquire_creates_dir_and_records_pid() {
        let root = tempfile::tempdir().unwrap();
        let flavor_dir = root.path().join("emodb/1.0.0/default");
        let lock = FlavorLock::acquire(&flavor_dir).await.unwrap();
        assert!(flavor_dir.is_dir());
        let holder = std::fs::read_to_string(lock.path()).unwrap();
        assert_eq!(holder.lines().next().unwrap(), std::process::id().to_string());
    }

    #[tokio::test]
    async fn test_lock_file_survives_release() {
        let root = tempfile::tempdir().unwrap();
        let flavor_dir = root.path().join("emodb/1.0.0/default");
        let lock = FlavorLock::acquire(&flavor_dir).await.unwrap();
        let lock_path = lock.path().to_path_buf();
        drop(lock);
        assert!(lock_path.is_file());
        // Reacquirable after release
        FlavorLock::acquire(&flavor_dir).await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_contended_lock_times_out() {
        let root = tempfile::tempdir().unwrap();
        let flavor_dir = root.path().join("emodb/1.0.0/default");
        std::fs::create_dir_all(&flavor_dir).unwrap();
        // A separately-opened descriptor holds the flock; same-process
        // contention behaves like another process for this API.
        let holder = OpenOptions::new().create(true).truncate(false).write(true)
            .open(flavor_dir.join(LOCK_FILE)).unwrap();
        holder.try_lock_exclusive().unwrap();

        let err = FlavorLock::acquire_with(&flavor_dir, Duration::from_millis(50), Duration::from_millis(400))
            .await
            .unwrap_err();
        assert!(matches!(&*err, ErrorKind::LockTimeout(_)));

        fs2::FileExt::unlock(&holder).unwrap();
        FlavorLock::acquire_with(&flavor_dir, Duration::from_millis(50), Duration::from_secs(5)).await.unwrap();
    }
}
