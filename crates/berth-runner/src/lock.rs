//! Exclusive advisory lock held for the duration of a run.

use std::fs::{self, File};
use std::path::{Path, PathBuf};

use berth_core::PlanError;
use fs2::FileExt;

/// Held lock on a lock file; released on drop.
#[derive(Debug)]
pub struct RunLock {
    file: File,
    path: PathBuf,
}

impl RunLock {
    /// Take the lock without blocking. Creates the lock file's directory if missing.
    pub fn acquire(path: impl Into<PathBuf>) -> Result<Self, PlanError> {
        let path = path.into();
        let lock_err = |source| PlanError::Lock {
            path: path.clone(),
            source,
        };

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(lock_err)?;
            }
        }
        let file = File::options()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&path)
            .map_err(lock_err)?;

        if let Err(e) = file.try_lock_exclusive() {
            if e.kind() == fs2::lock_contended_error().kind() {
                return Err(PlanError::Locked { path: path.clone() });
            }
            return Err(lock_err(e));
        }
        tracing::debug!(path = %path.display(), "run lock acquired");
        Ok(Self { file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_second_acquire_is_locked() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(".berth.lock");

        let first = RunLock::acquire(&path).unwrap();
        let err = RunLock::acquire(&path).unwrap_err();
        assert!(matches!(err, PlanError::Locked { .. }), "got {err:?}");

        drop(first);
        RunLock::acquire(&path).expect("lock should be free after drop");
    }

    #[test]
    fn test_acquire_creates_missing_directory() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("opt/sirbot/.berth.lock");
        let lock = RunLock::acquire(&path).unwrap();
        assert!(lock.path().exists());
    }
}
