//! Advisory file locks.
//!
//! One lock file per id in a lock directory, locked exclusively with
//! `flock`/`LockFileEx`. Every acquisition opens its own handle, so threads
//! of one process exclude each other the same way separate processes do. The
//! OS drops the lock when the holding process exits, which bounds how long a
//! crashed holder can block others.

use super::{LockManager, StateLock, new_holder};
use crate::models::{LockConfig, Result, TidemarkError, storage_name};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, warn};

/// Cross-process lock manager backed by lock files.
#[derive(Debug, Clone)]
pub struct FileLockManager {
    dir: PathBuf,
    timeout: Duration,
    poll_interval: Duration,
}

impl FileLockManager {
    /// Create a lock manager rooted at `dir`, creating it if needed.
    pub fn new(dir: &Path, config: &LockConfig) -> Result<Self> {
        fs::create_dir_all(dir)
            .map_err(|e| TidemarkError::backend("creating lock directory", None, e))?;

        Ok(Self {
            dir: dir.to_path_buf(),
            timeout: config.timeout(),
            poll_interval: config.poll_interval(),
        })
    }

    /// Override the acquisition timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    /// Lock directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn lock_path(&self, id: &str) -> PathBuf {
        self.dir.join(format!("{}.lock", storage_name(id)))
    }
}

impl LockManager for FileLockManager {
    fn acquire(&self, id: &str) -> Result<StateLock> {
        let path = self.lock_path(id);
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)
            .map_err(|e| TidemarkError::backend("opening lock file", Some(id), e))?;

        let started = Instant::now();
        loop {
            match file.try_lock_exclusive() {
                Ok(()) => break,
                Err(e) if is_contended(&e) => {
                    let waited = started.elapsed();
                    if waited >= self.timeout {
                        warn!(id = %id, waited_ms = waited.as_millis() as u64, "Lock wait timed out");
                        return Err(TidemarkError::LockTimeout {
                            id: id.to_string(),
                            waited,
                        });
                    }
                    thread::sleep(self.poll_interval.min(self.timeout - waited));
                }
                Err(e) => return Err(TidemarkError::backend("locking", Some(id), e)),
            }
        }

        let token = new_holder();
        // Holder token is informational only; a failed write does not void the lock.
        if let Err(e) = write_holder(&mut file, &token) {
            debug!(id = %id, error = %e, "Could not record lock holder");
        }

        debug!(id = %id, holder = %token, "Lock acquired");
        Ok(StateLock::new(
            id,
            token,
            FileRelease {
                id: id.to_string(),
                file,
            },
        ))
    }
}

fn is_contended(err: &std::io::Error) -> bool {
    err.kind() == std::io::ErrorKind::WouldBlock
        || err.raw_os_error() == fs2::lock_contended_error().raw_os_error()
}

fn write_holder(file: &mut File, token: &str) -> std::io::Result<()> {
    file.set_len(0)?;
    file.write_all(token.as_bytes())?;
    file.flush()
}

struct FileRelease {
    id: String,
    file: File,
}

impl Drop for FileRelease {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!(id = %self.id, error = %e, "Failed to unlock lock file; closing handle instead");
        }
        debug!(id = %self.id, "Lock released");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tempfile::TempDir;

    fn manager(dir: &Path, timeout_ms: u64) -> FileLockManager {
        let config = LockConfig {
            poll_interval_ms: 5,
            ..LockConfig::default()
        };
        FileLockManager::new(dir, &config)
            .unwrap()
            .with_timeout(Duration::from_millis(timeout_ms))
    }

    #[test]
    fn test_lock_file_is_created_under_dir() {
        let temp = TempDir::new().unwrap();
        let manager = manager(temp.path(), 100);

        let lock = manager.acquire("team/job").unwrap();
        let path = temp.path().join("team%2Fjob.lock");
        assert!(path.exists());
        assert_eq!(fs::read_to_string(&path).unwrap(), lock.holder());
    }

    #[test]
    fn test_long_id_uses_digest_lock_file() {
        let temp = TempDir::new().unwrap();
        let manager = manager(temp.path(), 50);
        let id = "a/".repeat(300);

        let _held = manager.acquire(&id).unwrap();
        assert!(manager.acquire(&id).unwrap_err().is_retryable());
        assert!(manager.acquire(&"b/".repeat(300)).is_ok());
    }

    #[test]
    fn test_second_handle_times_out() {
        let temp = TempDir::new().unwrap();
        let manager = manager(temp.path(), 50);

        let _held = manager.acquire("job-a").unwrap();
        let err = manager.acquire("job-a").unwrap_err();
        assert!(matches!(err, TidemarkError::LockTimeout { .. }));

        assert!(manager.acquire("job-b").is_ok());
    }

    #[test]
    fn test_release_allows_reacquire() {
        let temp = TempDir::new().unwrap();
        let manager = manager(temp.path(), 50);

        drop(manager.acquire("job-a").unwrap());
        assert!(manager.acquire("job-a").is_ok());
    }

    #[test]
    fn test_independent_managers_share_the_lock() {
        let temp = TempDir::new().unwrap();
        let first = manager(temp.path(), 50);
        let second = manager(temp.path(), 50);

        let _held = first.acquire("job-a").unwrap();
        assert!(second.acquire("job-a").is_err());
    }

    #[test]
    fn test_mutual_exclusion_across_threads() {
        let temp = TempDir::new().unwrap();
        let manager = Arc::new(manager(temp.path(), 10_000));
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..6)
            .map(|_| {
                let manager = Arc::clone(&manager);
                let inside = Arc::clone(&inside);
                let max_inside = Arc::clone(&max_inside);
                thread::spawn(move || {
                    for _ in 0..10 {
                        let _lock = manager.acquire("shared").unwrap();
                        let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                        max_inside.fetch_max(now, Ordering::SeqCst);
                        thread::sleep(Duration::from_millis(1));
                        inside.fetch_sub(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();

        for handle in handles {
            handle.join().unwrap();
        }
        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
    }
}
