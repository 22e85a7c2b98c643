//! Single-instance lock
//!
//! The quarantine directory is owned exclusively by one running instance; an
//! OS advisory lock on the lock file enforces that. The pid inside the file
//! is informational for operators; the lock itself is what gates.

use anyhow::{Context, Result};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

use crate::error::ShuttleError;

#[derive(Debug)]
pub struct InstanceLock {
    file: File,
    path: PathBuf,
}

impl InstanceLock {
    /// Acquire the lock or fail fast when another instance holds it.
    pub fn acquire(path: &Path) -> Result<Self> {
        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .with_context(|| format!("Failed to open lock file {}", path.display()))?;

        if file.try_lock_exclusive().is_err() {
            return Err(ShuttleError::LockHeld(path.to_path_buf()).into());
        }

        file.set_len(0)
            .and_then(|_| writeln!(file, "{}", std::process::id()))
            .with_context(|| format!("Failed to write pid to lock file {}", path.display()))?;

        debug!(lock = %path.display(), "Acquired single-instance lock");
        Ok(Self {
            file,
            path: path.to_path_buf(),
        })
    }
}

impl Drop for InstanceLock {
    fn drop(&mut self) {
        let _ = fs2::FileExt::unlock(&self.file);
        if let Err(e) = fs::remove_file(&self.path) {
            warn!(lock = %self.path.display(), error = %e, "Failed to remove lock file");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_lock_excludes_second_holder_and_releases_on_drop() {
        let tmp = TempDir::new().unwrap();
        let path = tmp.path().join("shuttle.lock");

        let lock = InstanceLock::acquire(&path).unwrap();
        let second = InstanceLock::acquire(&path);
        assert!(second.is_err());
        let err = second.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<ShuttleError>(),
            Some(ShuttleError::LockHeld(_))
        ));

        drop(lock);
        assert!(!path.exists());
        let reacquired = InstanceLock::acquire(&path).unwrap();
        drop(reacquired);
    }
}
