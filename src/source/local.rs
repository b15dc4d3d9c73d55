//! Local directory client
//!
//! Exposes a flat directory through the same client interface a remote
//! protocol adapter would implement. Subdirectories are not descended into.

use super::{Connector, RemoteClient};
use crate::backlog::RawEntry;
use crate::error::{ConnectError, ListError, RetrieveError};
use crate::store::validate_entry_name;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tokio::fs;
use tracing::{debug, warn};

/// Opens [`LocalDirClient`]s rooted at one directory
#[derive(Debug, Clone)]
pub struct LocalConnector {
    root: PathBuf,
}

impl LocalConnector {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

#[async_trait]
impl Connector for LocalConnector {
    type Client = LocalDirClient;

    async fn connect(&self) -> Result<LocalDirClient, ConnectError> {
        match fs::metadata(&self.root).await {
            Ok(meta) if meta.is_dir() => Ok(LocalDirClient {
                root: self.root.clone(),
            }),
            _ => Err(ConnectError::RootUnavailable(self.root.clone())),
        }
    }
}

/// Client over a local directory
#[derive(Debug)]
pub struct LocalDirClient {
    root: PathBuf,
}

impl LocalDirClient {
    async fn root_available(&self) -> bool {
        fs::metadata(&self.root)
            .await
            .map(|meta| meta.is_dir())
            .unwrap_or(false)
    }
}

#[async_trait]
impl RemoteClient for LocalDirClient {
    async fn list(&mut self) -> Result<Vec<RawEntry>, ListError> {
        let mut rows = Vec::new();
        let mut dir = fs::read_dir(&self.root).await?;

        while let Some(entry) = dir.next_entry().await? {
            let name = match entry.file_name().into_string() {
                Ok(name) => name,
                Err(raw) => {
                    warn!("Skipping non UTF-8 file name {:?}", raw);
                    continue;
                }
            };

            // Unreadable metadata still produces a row; it is dropped as
            // malformed when the snapshot is built
            let meta = match entry.metadata().await {
                Ok(meta) => meta,
                Err(e) => {
                    debug!("Failed to stat {}: {}", name, e);
                    rows.push(RawEntry {
                        name,
                        size: None,
                        modified_at: None,
                    });
                    continue;
                }
            };

            if !meta.is_file() {
                continue;
            }

            rows.push(RawEntry {
                name,
                size: i64::try_from(meta.len()).ok(),
                modified_at: meta.modified().ok().map(DateTime::<Utc>::from),
            });
        }

        Ok(rows)
    }

    async fn retrieve(&mut self, name: &str) -> Result<Bytes, RetrieveError> {
        validate_entry_name(name).map_err(|reason| RetrieveError::entry(name, reason))?;

        match fs::read(self.root.join(name)).await {
            Ok(content) => Ok(Bytes::from(content)),
            Err(e) if e.kind() == ErrorKind::InvalidInput => Err(RetrieveError::entry(name, e)),
            Err(e) => {
                if self.root_available().await {
                    Err(RetrieveError::entry(name, e))
                } else {
                    // The directory itself went away
                    Err(RetrieveError::Channel(format!(
                        "{}: {}",
                        self.root.display(),
                        e
                    )))
                }
            }
        }
    }
}
