//! File-based locking: one engine instance per database directory.
//!
//! Cross-platform (fs2) advisory lock on <root>/LOCK, taken with try-lock so
//! a second open fails fast instead of blocking. Released on Drop.

use anyhow::{Context, Result};
use fs2::FileExt;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

pub const LOCK_FILE: &str = "LOCK";

pub struct LockGuard {
    file: std::fs::File,
    path: PathBuf,
}

impl LockGuard {
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        // fs2 unlock errors on drop are ignored deliberately.
        let _ = self.file.unlock();
    }
}

/// Take the exclusive lock or fail if another handle (any process) holds it.
pub fn try_lock_exclusive(root: &Path) -> Result<LockGuard> {
    let path = root.join(LOCK_FILE);
    let file = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .open(&path)
        .with_context(|| format!("open lock file {}", path.display()))?;
    file.try_lock_exclusive()
        .with_context(|| format!("database is locked: {}", path.display()))?;
    Ok(LockGuard { file, path })
}
