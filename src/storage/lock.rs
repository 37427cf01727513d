//! Process-wide database directory lock.
//!
//! A single advisory exclusive lock on a well-known file under the
//! database prefix prevents two processes from opening the same database
//! for writing. The lock is owned by the `Database` instance and released
//! when it drops.

use std::fs::{File, OpenOptions};
use std::path::Path;

use eyre::{Result, WrapErr};
use fs2::FileExt;

pub const LOCK_FILE_NAME: &str = "lock";

#[derive(Debug)]
pub struct DirectoryLock {
    // Held for its side effect; the advisory lock dies with the handle.
    _file: File,
}

impl DirectoryLock {
    /// Acquires the exclusive lock for `prefix`, creating the lock file if
    /// necessary. Fails if another process already holds it.
    pub fn acquire(prefix: &Path) -> Result<Self> {
        let path = prefix.join(LOCK_FILE_NAME);

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .wrap_err_with(|| format!("failed to open lock file '{}'", path.display()))?;

        file.try_lock_exclusive().wrap_err_with(|| {
            format!("database '{}' is already open", prefix.display())
        })?;

        Ok(Self { _file: file })
    }
}
