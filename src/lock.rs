//! Single-instance guard.
//!
//! Two daemons reconciling the same chain would fight over rule positions,
//! so startup takes an advisory flock on a well-known path.

use anyhow::{Context, Result};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;

const LOCK_FILE: &str = "/var/run/filter-chain.lock";

/// Holds the exclusive lock; dropping it releases the lock.
pub struct LockGuard {
    _file: File,
}

impl LockGuard {
    /// Acquire the lock, failing fast if another instance holds it.
    pub fn acquire() -> Result<Self> {
        Self::acquire_at(Path::new(LOCK_FILE))
    }

    fn acquire_at(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).ok();
        }

        // create + read/write without truncate keeps open and lock free of
        // a TOCTOU window.
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(path)
            .with_context(|| format!("failed to open lock file {}", path.display()))?;

        fs::set_permissions(path, fs::Permissions::from_mode(0o600))
            .context("failed to set lock file permissions")?;

        file.try_lock_exclusive().map_err(|_| {
            anyhow::anyhow!(
                "another filter-chain instance is already running (lock held on {})",
                path.display()
            )
        })?;

        Ok(Self { _file: file })
    }
}
