// Per-framework advisory lock
//
// Non-blocking exclusive lock on `<state_dir>/locks/<framework>.lock`. The kernel drops
// the lock when the descriptor closes, including on crash, so a stale lock file is
// harmless and is never deleted.

use anyhow::{Context, Result};
use fs4::fs_std::FileExt;
use log::{debug, warn};
use std::fs::{File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

#[derive(Debug)]
pub struct FrameworkLock {
    file: File,
    path: PathBuf,
}

impl FrameworkLock {
    /// Take the lock for `framework_id`. `Ok(None)` when another session holds it.
    pub fn try_acquire(lock_dir: &Path, framework_id: &str) -> Result<Option<Self>> {
        std::fs::create_dir_all(lock_dir)
            .with_context(|| format!("Failed to create lock directory {:?}", lock_dir))?;
        let path = lock_dir.join(format!("{}.lock", framework_id));
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&path)
            .with_context(|| format!("Failed to open lock file {:?}", path))?;

        let acquired = match FileExt::try_lock_exclusive(&file) {
            Ok(acquired) => acquired,
            Err(e) if e.kind() == ErrorKind::WouldBlock => false,
            Err(e) => {
                return Err(anyhow::Error::new(e).context(format!("Failed to lock {:?}", path)))
            }
        };
        if !acquired {
            debug!(
                "[PHASE: installation] [STEP: lock] {:?} is held by another session",
                path
            );
            return Ok(None);
        }

        debug!("[PHASE: installation] [STEP: lock] Acquired {:?}", path);
        Ok(Some(FrameworkLock { file, path }))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl Drop for FrameworkLock {
    fn drop(&mut self) {
        if let Err(e) = FileExt::unlock(&self.file) {
            warn!(
                "[PHASE: installation] [STEP: lock] Failed to unlock {:?}: {}",
                self.path, e
            );
            return;
        }
        debug!("[PHASE: installation] [STEP: lock] Released {:?}", self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_fails_fast_until_release() {
        let tmp = tempfile::tempdir().unwrap();
        let first = FrameworkLock::try_acquire(tmp.path(), "android-studio")
            .unwrap()
            .expect("first lock");
        // The lock belongs to the open file description, so a second open conflicts
        // even inside one process.
        assert!(FrameworkLock::try_acquire(tmp.path(), "android-studio")
            .unwrap()
            .is_none());
        assert!(
            FrameworkLock::try_acquire(tmp.path(), "other").unwrap().is_some(),
            "locks are per framework"
        );

        drop(first);
        assert!(FrameworkLock::try_acquire(tmp.path(), "android-studio")
            .unwrap()
            .is_some());
    }
}
