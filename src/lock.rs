//! Per-device advisory locking.
//!
//! Two runs targeting the same router must never interleave their uploads
//! and applies; runs against different routers may proceed in parallel.

use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tracing::debug;

use crate::error::RtbhError;

/// Holds the exclusive lock for one device until dropped.
#[derive(Debug)]
pub struct LockGuard {
    _file: File,
    path: PathBuf,
}

/// Lock file path for `device` inside `lock_dir`.
pub fn lock_path(lock_dir: &Path, device: &str) -> PathBuf {
    let safe: String = device
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '.' || c == '-' {
                c
            } else {
                '_'
            }
        })
        .collect();
    lock_dir.join(format!("rtbh-{}.lock", safe))
}

impl LockGuard {
    /// Try to take the lock for `device` without blocking.
    ///
    /// The file is opened with create+read+write (no truncate) so that
    /// creation and locking do not race.
    pub fn acquire(lock_dir: &Path, device: &str) -> Result<Self, RtbhError> {
        fs::create_dir_all(lock_dir)?;
        let path = lock_path(lock_dir, device);

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        fs::set_permissions(&path, fs::Permissions::from_mode(0o600))?;

        file.try_lock_exclusive()
            .map_err(|_| RtbhError::LockContention {
                device: device.to_string(),
                lock_path: path.display().to_string(),
            })?;

        debug!("Acquired lock {:?}", path);
        Ok(Self { _file: file, path })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

// Released when the file handle closes on drop.
