// cli/src/lanzatool/lock.rs: one lzbt run per ESP at a time

use std::fs::{self, File, OpenOptions};
use std::path::PathBuf;

use fs2::FileExt;
use lanzaboote_shared::layout::LOCK_FILE;
use tracing::debug;

use super::error::{InstallError, Result};
use super::esp::Esp;

/// Exclusive advisory lock on `EFI/nixos/.lzbt.lock`, released on drop.
#[derive(Debug)]
pub struct EspLock {
    file: File,
    path: PathBuf,
}

impl EspLock {
    /// Never waits: a concurrent run is an error, not a queue.
    pub fn acquire(esp: &Esp) -> Result<Self> {
        let path = esp.path(LOCK_FILE);
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).map_err(InstallError::esp_write(dir))?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(InstallError::esp_write(&path))?;

        match file.try_lock_exclusive() {
            Ok(()) => {
                debug!(path = %path.display(), "ESP lock held");
                Ok(Self { file, path })
            }
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => {
                Err(InstallError::EspLocked(esp.root().to_path_buf()))
            }
            Err(e) => Err(InstallError::io(format!("lock {}", path.display()))(e)),
        }
    }
}

impl Drop for EspLock {
    fn drop(&mut self) {
        let _ = FileExt::unlock(&self.file);
        debug!(path = %self.path.display(), "ESP lock released");
    }
}
