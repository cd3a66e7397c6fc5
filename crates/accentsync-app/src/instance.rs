//! Single-instance guard.
//!
//! Two daemons would fight over the devices (each undoing the other's
//! writes after a reconnect), so the runner takes an exclusive lock on a
//! file under the local data directory before doing anything else.

use accentsync_core::prelude::*;
use fs2::FileExt;
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

const LOCK_FILENAME: &str = "accent-sync.lock";
const DATA_DIR: &str = "accent-sync";

/// Exclusive lock on the instance lock file, held until dropped.
#[derive(Debug)]
pub struct InstanceLock {
    file: File,
    path: PathBuf,
}

impl InstanceLock {
    /// Acquire the lock at the default location,
    /// `<local data dir>/accent-sync/accent-sync.lock`.
    pub fn acquire() -> Result<Self> {
        let path = default_lock_path()?;
        Self::acquire_at(&path)
    }

    /// Acquire the lock at `path`, creating parent directories as needed.
    ///
    /// # Errors
    ///
    /// [`Error::AlreadyRunning`] when another process holds the lock;
    /// [`Error::Config`] when the lock file itself can't be created.
    pub fn acquire_at(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .map_err(|e| Error::config(format!("Failed to create lock dir: {}", e)))?;
        }

        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .map_err(|e| Error::config(format!("Failed to open lock file {:?}: {}", path, e)))?;

        file.try_lock_exclusive().map_err(|e| {
            if e.kind() == fs2::lock_contended_error().kind() {
                Error::already_running(path)
            } else {
                Error::config(format!("Failed to lock {:?}: {}", path, e))
            }
        })?;

        debug!("Holding instance lock at {:?}", path);
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
    }
}

fn default_lock_path() -> Result<PathBuf> {
    dirs::data_local_dir()
        .map(|dir| dir.join(DATA_DIR).join(LOCK_FILENAME))
        .ok_or_else(|| Error::config("No local data directory on this host"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_acquire_creates_lock_file() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("deep").join("accent-sync.lock");

        let lock = InstanceLock::acquire_at(&path).unwrap();
        assert!(path.exists());
        assert_eq!(lock.path(), path);
    }

    #[test]
    fn test_second_acquire_fails_while_held() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("accent-sync.lock");

        let _held = InstanceLock::acquire_at(&path).unwrap();
        let err = InstanceLock::acquire_at(&path).unwrap_err();

        assert!(matches!(err, Error::AlreadyRunning { .. }));
        assert!(err.is_fatal());
        assert!(err.to_string().contains("accent-sync.lock"));
    }

    #[test]
    fn test_drop_releases_the_lock() {
        let temp = tempdir().unwrap();
        let path = temp.path().join("accent-sync.lock");

        {
            let _held = InstanceLock::acquire_at(&path).unwrap();
        }

        // Once the first guard is gone the lock is free again.
        let _reacquired = InstanceLock::acquire_at(&path).unwrap();
    }
}
