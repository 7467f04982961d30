//! Per-package advisory locks.
//!
//! Staging, activation and removal of one package name are serialized through
//! an exclusive `flock` on `var/keg/locks/<name>.lock`. Locks are released when
//! the guard is dropped, including when the process dies.

use crate::config::Layout;
use crate::error::{KegError, Result};
use fs4::FileExt;
use std::fs::{self, File, OpenOptions};
use std::path::PathBuf;
use std::time::Duration;
use tracing::debug;

/// Held exclusive lock on one package name.
#[derive(Debug)]
pub struct PackageLock {
    file: File,
    path: PathBuf,
}

impl PackageLock {
    /// Wait up to `timeout` for the lock on `name`.
    ///
    /// The wait runs on the blocking pool. If it times out, the pending wait
    /// still completes in the background and releases the lock immediately.
    pub async fn acquire(layout: &Layout, name: &str, timeout: Duration) -> Result<Self> {
        let path = layout.lock_path(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(&path)?;

        let wait = tokio::task::spawn_blocking(move || {
            file.lock_exclusive()?;
            Ok::<File, std::io::Error>(file)
        });

        match tokio::time::timeout(timeout, wait).await {
            Ok(joined) => {
                let file = joined.map_err(|e| KegError::Other(e.into()))??;
                debug!(lock = %path.display(), "lock acquired");
                Ok(Self { file, path })
            }
            Err(_) => Err(KegError::timeout(
                format!("waiting for lock on {}", name),
                timeout,
            )),
        }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }
}

impl Drop for PackageLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
    }
}
