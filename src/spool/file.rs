//! Temporary spool files

use crate::error::{Error, Result};
use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use uuid::Uuid;

/// A uniquely named temp file in the spool directory
///
/// Move-only: whoever holds the `SpoolFile` is responsible for deleting it.
/// Dropping an undeleted file removes it from disk.
#[derive(Debug)]
pub struct SpoolFile {
    path: PathBuf,
    deleted: bool,
}

impl SpoolFile {
    /// Create an empty spool file inside `dir`, creating `dir` if needed
    pub fn create<P: AsRef<Path>>(dir: P) -> Result<Self> {
        let dir = dir.as_ref();
        std::fs::create_dir_all(dir)
            .map_err(|e| Error::Storage(format!("Failed to create spool directory: {}", e)))?;

        let path = dir.join(format!("ResultSpooler{}.bin", Uuid::new_v4().simple()));
        OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| Error::Storage(format!("Failed to create spool file: {}", e)))?;

        debug!(path = ?path, "Created spool file");
        Ok(Self {
            path,
            deleted: false,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Open the file for appending spooled bytes
    pub fn open_write(&self) -> Result<File> {
        OpenOptions::new()
            .write(true)
            .truncate(true)
            .open(&self.path)
            .map_err(|e| Error::Storage(format!("Failed to open spool file for writing: {}", e)))
    }

    /// Open the file for replay
    pub fn open_read(&self) -> Result<File> {
        File::open(&self.path)
            .map_err(|e| Error::Storage(format!("Failed to open spool file for reading: {}", e)))
    }

    /// Remove the file from disk
    ///
    /// A file that is already gone counts as deleted.
    pub fn delete(mut self) -> Result<()> {
        self.remove()
    }

    fn remove(&mut self) -> Result<()> {
        if self.deleted {
            return Ok(());
        }
        self.deleted = true;
        match std::fs::remove_file(&self.path) {
            Ok(()) => {
                debug!(path = ?self.path, "Deleted spool file");
                Ok(())
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Storage(format!(
                "Failed to delete spool file {}: {}",
                self.path.display(),
                e
            ))),
        }
    }
}

impl Drop for SpoolFile {
    fn drop(&mut self) {
        if let Err(e) = self.remove() {
            warn!("{}", e);
        }
    }
}
