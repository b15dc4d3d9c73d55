//! Dispatch units and the sink they are handed to.
//!
//! Poller -> consumer, over a bounded channel for backpressure.

use crate::backlog::FileInfo;
use crate::error::DispatchError;
use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Capacity of the poller -> consumer channel
pub const DISPATCH_CHANNEL_SIZE: usize = 16;

// =============================================================================
// DispatchUnit: Poller -> Consumer
// =============================================================================

/// One retrieved entry
#[derive(Debug, Clone)]
pub struct RetrievedEntry {
    /// Listing metadata at selection time
    pub info: FileInfo,

    /// Entry content
    pub content: Bytes,
}

/// Everything one poll cycle retrieved successfully.
///
/// The consumer confirms `names` once it has accepted the unit; until then the
/// entries stay in flight and are not dispatched again.
#[derive(Debug, Clone, Default)]
pub struct DispatchUnit {
    /// Entry names, in selection order
    pub names: Vec<String>,

    /// Retrieved entries, aligned with `names`
    pub payload: Vec<RetrievedEntry>,
}

impl DispatchUnit {
    pub fn new(payload: Vec<RetrievedEntry>) -> Self {
        let names = payload
            .iter()
            .map(|entry| entry.info.name().to_string())
            .collect();
        Self { names, payload }
    }

    pub fn len(&self) -> usize {
        self.payload.len()
    }

    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }

    pub fn total_bytes(&self) -> u64 {
        self.payload
            .iter()
            .map(|entry| entry.content.len() as u64)
            .sum()
    }
}

// =============================================================================
// Sinks
// =============================================================================

/// Consumer boundary for dispatch units
#[async_trait]
pub trait DispatchSink: Send + Sync {
    /// Hand a unit to the consumer. An error means the unit was not accepted
    /// and nothing was delivered.
    async fn dispatch(&self, unit: DispatchUnit) -> Result<(), DispatchError>;
}

#[async_trait]
impl<T: DispatchSink + ?Sized> DispatchSink for Arc<T> {
    async fn dispatch(&self, unit: DispatchUnit) -> Result<(), DispatchError> {
        (**self).dispatch(unit).await
    }
}

/// Receiving half of a dispatch channel
pub type DispatchReceiver = mpsc::Receiver<DispatchUnit>;

/// Sink that forwards units over a bounded channel
#[derive(Debug, Clone)]
pub struct ChannelSink {
    tx: mpsc::Sender<DispatchUnit>,
}

#[async_trait]
impl DispatchSink for ChannelSink {
    async fn dispatch(&self, unit: DispatchUnit) -> Result<(), DispatchError> {
        self.tx.send(unit).await.map_err(|_| DispatchError::Closed)
    }
}

/// Create a bounded channel for Poller -> Consumer communication
pub fn dispatch_channel(capacity: usize) -> (ChannelSink, DispatchReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (ChannelSink { tx }, rx)
}

// =============================================================================
// Tests
// =============================================================================
