//! Local working directory for dispatched entries.
//!
//! Each retrieved entry is written to a temp file next to its destination and
//! renamed into place, replacing any stale copy from an earlier version. The
//! file's mtime is set to the modification time reported by the source.

use crate::error::StoreError;
use crate::poller::{DispatchUnit, RetrievedEntry};
use filetime::FileTime;
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};

/// Check that an entry name is a single plain path component, so it can
/// neither escape the working directory nor address a subdirectory.
pub fn validate_entry_name(name: &str) -> Result<(), &'static str> {
    if name.is_empty() {
        return Err("empty name");
    }
    if name.contains('\0') {
        return Err("name contains NUL");
    }
    if name.contains('/') || name.contains('\\') {
        return Err("name contains a path separator");
    }

    let mut components = Path::new(name).components();
    match (components.next(), components.next()) {
        (Some(Component::Normal(_)), None) => Ok(()),
        (Some(Component::ParentDir), _) | (Some(Component::CurDir), _) => {
            Err("relative path component")
        }
        _ => Err("not a plain file name"),
    }
}

/// Writes dispatch units into a local directory
#[derive(Debug, Clone)]
pub struct LocalStore {
    dir: PathBuf,
}

impl LocalStore {
    /// Open the store, creating the directory if needed
    pub async fn open(dir: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let dir = dir.into();
        fs::create_dir_all(&dir).await?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write every entry of the unit. Returns the stored paths in unit order.
    ///
    /// Stops at the first failure; entries already written stay on disk and
    /// are overwritten when the unit is redelivered.
    pub async fn store(&self, unit: &DispatchUnit) -> Result<Vec<PathBuf>, StoreError> {
        let mut stored = Vec::with_capacity(unit.len());
        for entry in &unit.payload {
            stored.push(self.store_entry(entry).await?);
        }
        Ok(stored)
    }

    pub async fn store_entry(&self, entry: &RetrievedEntry) -> Result<PathBuf, StoreError> {
        let name = entry.info.name();
        validate_entry_name(name).map_err(|reason| StoreError::InvalidName {
            name: name.to_string(),
            reason,
        })?;

        let dir = self.dir.clone();
        let target = self.dir.join(name);
        let content = entry.content.clone();
        let modified = entry.info.modified_at();

        let written = target.clone();
        tokio::task::spawn_blocking(move || -> Result<(), StoreError> {
            let write_err = |source| StoreError::Write {
                path: target.clone(),
                source,
            };

            let mut temp = tempfile::NamedTempFile::new_in(&dir).map_err(write_err)?;
            temp.write_all(&content).map_err(write_err)?;
            temp.as_file().sync_all().map_err(write_err)?;
            temp.persist(&target).map_err(|e| write_err(e.error))?;

            let mtime = FileTime::from_unix_time(
                modified.timestamp(),
                modified.timestamp_subsec_nanos(),
            );
            if let Err(e) = filetime::set_file_mtime(&target, mtime) {
                warn!("Failed to set mtime on {}: {}", target.display(), e);
            }
            Ok(())
        })
        .await
        .map_err(|e| StoreError::Io(std::io::Error::new(std::io::ErrorKind::Other, e)))??;

        debug!("Stored {} ({} bytes)", written.display(), entry.content.len());
        Ok(written)
    }
}
