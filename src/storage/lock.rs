//! Advisory lock over the engine's data directory.

use std::fs::{File, OpenOptions};
use std::path::Path;

use fs2::FileExt;

use crate::error::StorageError;

/// Name of the lock file inside the engine directory.
pub const LOCK_FILE: &str = ".lock";

/// Holds `flock(2)`-style advisory exclusivity over one data directory,
/// so at most one engine instance mutates its files at a time. The lock
/// is released when this struct is dropped (the file descriptor is
/// closed).
#[derive(Debug)]
pub struct DirLock {
    _file: File,
}

impl DirLock {
    /// Acquire the directory lock without blocking. Fails with
    /// `DirectoryLocked` if another engine instance holds it.
    pub fn acquire(dir: &Path) -> Result<Self, StorageError> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(dir.join(LOCK_FILE))?;

        file.try_lock_exclusive()
            .map_err(|_| StorageError::DirectoryLocked)?;

        Ok(Self { _file: file })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_second_acquire_fails_while_held() {
        let dir = tempdir().unwrap();

        let lock = DirLock::acquire(dir.path()).unwrap();
        match DirLock::acquire(dir.path()) {
            Err(StorageError::DirectoryLocked) => {}
            other => panic!("expected DirectoryLocked, got {other:?}"),
        }
        drop(lock);
    }

    #[test]
    fn test_released_on_drop() {
        let dir = tempdir().unwrap();

        {
            let _lock = DirLock::acquire(dir.path()).unwrap();
        }
        // After drop the lock can be re-acquired.
        let _lock = DirLock::acquire(dir.path()).unwrap();
    }
}
