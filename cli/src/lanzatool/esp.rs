// cli/src/lanzatool/esp.rs: crash-safe writes to the EFI system partition
//
// Every file lands via temp file in the target directory, fsync, rename,
// fsync of the directory. A crash leaves either the old file or the new one
// plus possibly a `.lzbt-*` temp file that the next GC removes.

use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use lanzaboote_shared::layout::TEMP_PREFIX;
use tracing::{debug, trace};

use super::error::{InstallError, Result};

#[derive(Debug, Clone)]
pub struct Esp {
    root: PathBuf,
}

impl Esp {
    pub fn open(root: &Path) -> Result<Self> {
        if !root.is_dir() {
            return Err(InstallError::Config(format!("ESP {} is not a directory", root.display())));
        }
        Ok(Self { root: root.to_path_buf() })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Absolute path of an ESP-relative `/` separated path.
    pub fn path(&self, relative: &str) -> PathBuf {
        self.root.join(relative)
    }

    pub fn read(&self, relative: &str) -> io::Result<Vec<u8>> {
        fs::read(self.path(relative))
    }

    pub fn exists(&self, relative: &str) -> bool {
        self.path(relative).is_file()
    }

    /// Atomically replace `relative` with `contents`.
    pub fn write_atomic(&self, relative: &str, contents: &[u8]) -> Result<()> {
        let target = self.path(relative);
        let dir = target
            .parent()
            .ok_or_else(|| InstallError::Config(format!("{relative} has no parent directory")))?;
        fs::create_dir_all(dir).map_err(InstallError::esp_write(dir))?;

        let mut temp = tempfile::Builder::new()
            .prefix(TEMP_PREFIX)
            .tempfile_in(dir)
            .map_err(InstallError::esp_write(&target))?;
        temp.write_all(contents).map_err(InstallError::esp_write(&target))?;
        temp.as_file().sync_all().map_err(InstallError::esp_write(&target))?;
        temp.persist(&target)
            .map_err(|e| InstallError::EspWriteFailure { path: target.clone(), source: e.error })?;
        sync_dir(dir).map_err(InstallError::esp_write(dir))?;

        debug!(path = %relative, bytes = contents.len(), "written");
        Ok(())
    }

    /// Like [`Esp::write_atomic`] but leaves an identical file alone.
    /// Returns whether anything was written.
    pub fn write_if_changed(&self, relative: &str, contents: &[u8]) -> Result<bool> {
        if let Ok(existing) = self.read(relative) {
            if existing == contents {
                trace!(path = %relative, "unchanged");
                return Ok(false);
            }
        }
        self.write_atomic(relative, contents)?;
        Ok(true)
    }

    pub fn remove(&self, relative: &str) -> Result<()> {
        let path = self.path(relative);
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(InstallError::EspWriteFailure { path, source: e }),
        }
    }

    /// File names directly inside `dir`, sorted. A missing directory is empty.
    pub fn list(&self, dir: &str) -> Result<Vec<String>> {
        let path = self.path(dir);
        let entries = match fs::read_dir(&path) {
            Ok(entries) => entries,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(InstallError::io(format!("list {}", path.display()))(e)),
        };
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(InstallError::io(format!("list {}", path.display())))?;
            if entry.file_type().map(|t| t.is_file()).unwrap_or(false) {
                if let Some(name) = entry.file_name().to_str() {
                    names.push(name.to_string());
                }
            }
        }
        names.sort();
        Ok(names)
    }
}

fn sync_dir(dir: &Path) -> io::Result<()> {
    File::open(dir)?.sync_all()
}
