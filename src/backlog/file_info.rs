//! Snapshot records for entries in a polled source.

use crate::error::MalformedEntryError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::btree_map::{self, BTreeMap};

/// One entry as observed in a single listing. Immutable once built.
///
/// Identity is `name`. Two records with the same name but a different size or
/// modification time are two versions of the same logical entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FileInfo {
    name: String,
    size: u64,
    modified_at: DateTime<Utc>,
}

impl FileInfo {
    pub fn new(name: impl Into<String>, size: u64, modified_at: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            size,
            modified_at,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn size(&self) -> u64 {
        self.size
    }

    pub fn modified_at(&self) -> DateTime<Utc> {
        self.modified_at
    }

    /// Same logical entry, different version
    pub fn differs_from(&self, other: &FileInfo) -> bool {
        self.size != other.size || self.modified_at != other.modified_at
    }
}

/// A listing row as reported by a protocol client, before validation.
///
/// Listing parsers are allowed to report rows they could only partially
/// understand; such rows are dropped when the snapshot is built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawEntry {
    pub name: String,
    pub size: Option<i64>,
    pub modified_at: Option<DateTime<Utc>>,
}

impl RawEntry {
    pub fn new(name: impl Into<String>, size: i64, modified_at: DateTime<Utc>) -> Self {
        Self {
            name: name.into(),
            size: Some(size),
            modified_at: Some(modified_at),
        }
    }
}

impl TryFrom<RawEntry> for FileInfo {
    type Error = MalformedEntryError;

    fn try_from(row: RawEntry) -> Result<Self, Self::Error> {
        if row.name.is_empty() {
            return Err(MalformedEntryError::EmptyName);
        }
        let size = match row.size {
            None => return Err(MalformedEntryError::MissingSize { name: row.name }),
            Some(size) if size < 0 => {
                return Err(MalformedEntryError::NegativeSize {
                    name: row.name,
                    size,
                })
            }
            Some(size) => size as u64,
        };
        let Some(modified_at) = row.modified_at else {
            return Err(MalformedEntryError::MissingTimestamp { name: row.name });
        };

        Ok(FileInfo {
            name: row.name,
            size,
            modified_at,
        })
    }
}

/// Full set of entries observed in one poll, keyed by name.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Snapshot {
    entries: BTreeMap<String, FileInfo>,
    skipped: usize,
}

impl Snapshot {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a snapshot from raw listing rows.
    ///
    /// Malformed rows are skipped with a warning and counted in
    /// [`Snapshot::skipped`]. A repeated name keeps the last row.
    pub fn from_rows(rows: impl IntoIterator<Item = RawEntry>) -> Self {
        let mut snapshot = Snapshot::new();
        for row in rows {
            match FileInfo::try_from(row) {
                Ok(info) => snapshot.insert(info),
                Err(e) => {
                    tracing::warn!("Skipping malformed listing row: {}", e);
                    snapshot.skipped += 1;
                }
            }
        }
        snapshot
    }

    pub fn insert(&mut self, info: FileInfo) {
        if let Some(previous) = self.entries.insert(info.name.clone(), info) {
            tracing::warn!("Listing reported '{}' more than once", previous.name);
        }
    }

    pub fn get(&self, name: &str) -> Option<&FileInfo> {
        self.entries.get(name)
    }

    pub fn iter(&self) -> btree_map::Values<'_, String, FileInfo> {
        self.entries.values()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Rows dropped because their metadata was unreadable
    pub fn skipped(&self) -> usize {
        self.skipped
    }
}

impl FromIterator<FileInfo> for Snapshot {
    fn from_iter<I: IntoIterator<Item = FileInfo>>(iter: I) -> Self {
        let mut snapshot = Snapshot::new();
        for info in iter {
            snapshot.insert(info);
        }
        snapshot
    }
}

impl<'a> IntoIterator for &'a Snapshot {
    type Item = &'a FileInfo;
    type IntoIter = btree_map::Values<'a, String, FileInfo>;

    fn into_iter(self) -> Self::IntoIter {
        self.entries.values()
    }
}
