//! Advisory lock on the history storage directory.
//!
//! Один процесс-владелец (engine или standby-receiver) держит Exclusive на всё
//! время жизни ShortTermHistory. CLI-инструменты чтения берут Shared через try_*
//! и не ждут.
//!
//! Lock file path: <dir>/LOCK. Released on Drop.

use anyhow::{Context, Result};
use fs2::FileExt;
use std::fs::OpenOptions;
use std::path::{Path, PathBuf};

use crate::consts::LOCK_FILE;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

pub struct DirLock {
    file: std::fs::File,
    path: PathBuf,
    mode: LockMode,
}

impl DirLock {
    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn mode(&self) -> LockMode {
        self.mode
    }
}

impl Drop for DirLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

impl std::fmt::Debug for DirLock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DirLock")
            .field("path", &self.path)
            .field("mode", &self.mode)
            .finish()
    }
}

fn open_lock_file(dir: &Path) -> Result<(std::fs::File, PathBuf)> {
    let path = dir.join(LOCK_FILE);
    let f = OpenOptions::new()
        .create(true)
        .read(true)
        .write(true)
        .open(&path)
        .with_context(|| format!("open lock file {}", path.display()))?;
    Ok((f, path))
}

/// Try to take the directory lock without blocking.
pub fn try_lock_dir(dir: &Path, mode: LockMode) -> Result<DirLock> {
    let (file, path) = open_lock_file(dir)?;
    match mode {
        LockMode::Shared => file
            .try_lock_shared()
            .with_context(|| format!("history dir is locked: {}", path.display()))?,
        LockMode::Exclusive => file
            .try_lock_exclusive()
            .with_context(|| format!("history dir is locked: {}", path.display()))?,
    }
    Ok(DirLock { file, path, mode })
}
