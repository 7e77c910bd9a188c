//! Named advisory locks shared between strata processes.
//!
//! Locks are `flock`s on files under `<store>/locks`, so the kernel releases
//! them when a holder dies. Acquisition blocks until the lock is granted and
//! the wait is reported to telemetry.

use std::fs::{File, OpenOptions};
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::Instant;

use crate::errors::{StrataError, StrataResult};
use crate::telemetry::Emitter;

/// Lock key for store-wide operations (init/delete-store exclusively,
/// image creation shared).
pub const GLOBAL_LOCK_KEY: &str = "global";

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Mode {
    Shared,
    Exclusive,
}

/// A held lock. Dropping the handle releases it; so does process death.
#[derive(Debug)]
pub struct LockHandle {
    file: File,
    path: PathBuf,
}

impl Drop for LockHandle {
    fn drop(&mut self) {
        let fd = self.file.as_raw_fd();
        unsafe {
            libc::flock(fd, libc::LOCK_UN);
        }
        tracing::debug!(lock_path = %self.path.display(), "released-lock");
    }
}

/// Keyed shared/exclusive file locks rooted at a store's locks directory.
#[derive(Clone, Debug)]
pub struct FileSystemLocksmith {
    locks_dir: PathBuf,
    metrics: Emitter,
}

impl FileSystemLocksmith {
    pub fn new(locks_dir: PathBuf, metrics: Emitter) -> Self {
        Self { locks_dir, metrics }
    }

    /// Acquire `key` exclusively, blocking out every other holder.
    pub fn lock_exclusive(&self, key: &str) -> StrataResult<LockHandle> {
        self.lock(key, Mode::Exclusive)
    }

    /// Acquire `key` shared: compatible with other shared holders, blocks
    /// and is blocked by exclusive holders.
    pub fn lock_shared(&self, key: &str) -> StrataResult<LockHandle> {
        self.lock(key, Mode::Shared)
    }

    /// Explicit release, for callers that want to unlock before scope end.
    pub fn unlock(&self, handle: LockHandle) {
        drop(handle);
    }

    fn lock(&self, key: &str, mode: Mode) -> StrataResult<LockHandle> {
        let path = self.lock_file_path(key);
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .map_err(|e| {
                StrataError::Backend(format!(
                    "creating lock file {}: {}",
                    path.display(),
                    e
                ))
            })?;

        let (operation, metric) = match mode {
            Mode::Shared => (libc::LOCK_SH, "SharedLockingTime"),
            Mode::Exclusive => (libc::LOCK_EX, "ExclusiveLockingTime"),
        };

        let start = Instant::now();
        let result = unsafe { libc::flock(file.as_raw_fd(), operation) };
        self.metrics.try_emit_duration_from(metric, start);

        if result != 0 {
            let err = std::io::Error::last_os_error();
            return Err(StrataError::Backend(format!(
                "acquiring lock {}: {}",
                path.display(),
                err
            )));
        }

        tracing::debug!(lock_path = %path.display(), ?mode, "acquired-lock");
        Ok(LockHandle { file, path })
    }

    fn lock_file_path(&self, key: &str) -> PathBuf {
        // Keys are opaque and may look like paths; collapse them to one
        // lock-file name.
        let sanitized: String = key.chars().filter(|c| *c != '/').collect();
        self.locks_dir.join(format!("{}.lock", sanitized))
    }
}

/// Locksmith rooted at a store path, for callers that only have the store.
pub fn for_store(store_path: &Path, metrics: Emitter) -> FileSystemLocksmith {
    FileSystemLocksmith::new(store_path.join(crate::store::layout::LOCKS_DIR), metrics)
}
