//! Collaborators that talk to the polled source.
//!
//! The poller only needs two capabilities: list the source
//! ([`SnapshotProvider`]) and fetch one entry's bytes ([`ContentRetriever`]).
//! Protocol adapters implement [`RemoteClient`]; [`PooledSource`] turns any
//! of them into both capabilities by checking clients out of a [`ClientPool`]
//! for the duration of a single call.

pub mod local;
pub mod pool;

pub use local::{LocalConnector, LocalDirClient};
pub use pool::{ClientPool, PooledClient};

use crate::backlog::{RawEntry, Snapshot};
use crate::error::{ConnectError, ListError, RetrieveError};
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tracing::debug;

/// Lists the source and reports every entry currently present.
#[async_trait]
pub trait SnapshotProvider: Send + Sync {
    /// Must not report a name twice. Rows with unreadable metadata are left
    /// out of the snapshot rather than represented by placeholders.
    async fn list(&self) -> Result<Snapshot, ListError>;
}

/// Fetches the content of one entry. Calling it again for the same name must
/// be safe.
#[async_trait]
pub trait ContentRetriever: Send + Sync {
    async fn retrieve(&self, name: &str) -> Result<Bytes, RetrieveError>;
}

#[async_trait]
impl<T: SnapshotProvider + ?Sized> SnapshotProvider for Arc<T> {
    async fn list(&self) -> Result<Snapshot, ListError> {
        (**self).list().await
    }
}

#[async_trait]
impl<T: ContentRetriever + ?Sized> ContentRetriever for Arc<T> {
    async fn retrieve(&self, name: &str) -> Result<Bytes, RetrieveError> {
        (**self).retrieve(name).await
    }
}

/// A protocol-specific client (FTP session, local directory handle, ...)
#[async_trait]
pub trait RemoteClient: Send {
    /// Raw listing rows. Rows may carry unreadable metadata.
    async fn list(&mut self) -> Result<Vec<RawEntry>, ListError>;

    async fn retrieve(&mut self, name: &str) -> Result<Bytes, RetrieveError>;
}

/// Opens new [`RemoteClient`]s for a [`ClientPool`]
#[async_trait]
pub trait Connector: Send + Sync {
    type Client: RemoteClient;

    async fn connect(&self) -> Result<Self::Client, ConnectError>;
}

/// Snapshot provider and content retriever backed by a client pool
pub struct PooledSource<C: Connector> {
    pool: ClientPool<C>,
}

impl<C: Connector> PooledSource<C> {
    pub fn new(pool: ClientPool<C>) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &ClientPool<C> {
        &self.pool
    }
}

#[async_trait]
impl<C: Connector> SnapshotProvider for PooledSource<C> {
    async fn list(&self) -> Result<Snapshot, ListError> {
        let mut client = self.pool.acquire().await?;
        match client.list().await {
            Ok(rows) => Ok(Snapshot::from_rows(rows)),
            Err(e) => {
                // Connection state is unknown after a failed listing
                client.discard();
                Err(e)
            }
        }
    }
}

#[async_trait]
impl<C: Connector> ContentRetriever for PooledSource<C> {
    async fn retrieve(&self, name: &str) -> Result<Bytes, RetrieveError> {
        let mut client = self.pool.acquire().await?;
        let result = client.retrieve(name).await;
        match &result {
            Err(e) if e.is_channel() => client.discard(),
            Ok(content) => debug!("Retrieved {} ({} bytes)", name, content.len()),
            Err(_) => {}
        }
        result
    }
}
