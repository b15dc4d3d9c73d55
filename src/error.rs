//! Error types for dirpoll
//!
//! Nothing in here is fatal to the process. Every error either leaves the
//! backlog in its prior state (listing, channel and dispatch failures) or is
//! reported and skipped (single entries, malformed listing rows).

use std::path::PathBuf;
use thiserror::Error;

/// The source listing could not be obtained. The poll cycle is aborted and the
/// backlog is left untouched.
#[derive(Error, Debug)]
pub enum ListError {
    /// No client could be checked out of the pool
    #[error("failed to connect to source: {0}")]
    Connect(#[from] ConnectError),

    /// I/O failure while reading the listing
    #[error("I/O error while listing source: {0}")]
    Io(#[from] std::io::Error),

    /// The listing response could not be understood
    #[error("protocol error while listing source: {0}")]
    Protocol(String),
}

/// Fetching entry content failed.
#[derive(Error, Debug)]
pub enum RetrieveError {
    /// Only this entry is affected; it goes back to pending and the rest of the
    /// batch continues.
    #[error("failed to retrieve '{name}': {reason}")]
    Entry { name: String, reason: String },

    /// The retrieval channel itself is gone; the whole batch is rolled back.
    #[error("retrieval channel failed: {0}")]
    Channel(String),
}

impl RetrieveError {
    pub fn entry(name: impl Into<String>, reason: impl ToString) -> Self {
        RetrieveError::Entry {
            name: name.into(),
            reason: reason.to_string(),
        }
    }

    /// Whether this failure takes down the whole batch
    pub fn is_channel(&self) -> bool {
        matches!(self, RetrieveError::Channel(_))
    }
}

impl From<ConnectError> for RetrieveError {
    fn from(err: ConnectError) -> Self {
        RetrieveError::Channel(err.to_string())
    }
}

/// A listing row whose metadata could not be read. The row is skipped.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MalformedEntryError {
    #[error("listing row has an empty name")]
    EmptyName,

    #[error("size of '{name}' is unreadable")]
    MissingSize { name: String },

    #[error("size of '{name}' is negative ({size})")]
    NegativeSize { name: String, size: i64 },

    #[error("modification time of '{name}' is unreadable")]
    MissingTimestamp { name: String },
}

/// Failure to open a protocol client
#[derive(Error, Debug, Clone)]
pub enum ConnectError {
    #[error("source root '{}' is not an accessible directory", .0.display())]
    RootUnavailable(PathBuf),

    #[error("connection pool is closed")]
    PoolClosed,

    #[error("{0}")]
    Other(String),
}

/// The downstream consumer refused a dispatch unit
#[derive(Error, Debug)]
pub enum DispatchError {
    #[error("dispatch channel closed")]
    Closed,

    #[error("dispatch rejected: {0}")]
    Rejected(String),
}

/// Materializing a dispatch unit on local disk failed
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("refusing to store '{name}': {reason}")]
    InvalidName { name: String, reason: &'static str },

    #[error("failed to write '{}': {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Configuration errors
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("max batch size must be positive or -1 for unbounded, got {0}")]
    InvalidBatchSize(i64),

    #[error("{field} must be greater than zero")]
    Zero { field: &'static str },

    #[error("missing required setting '{0}'")]
    Missing(&'static str),

    #[error("failed to read config file '{}': {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config file: {0}")]
    Parse(#[from] toml::de::Error),
}

/// Outcome of a failed poll cycle. The backlog is back in a well-defined state
/// whenever one of these is returned.
#[derive(Error, Debug)]
pub enum PollError {
    /// Listing failed; nothing changed
    #[error("poll aborted, listing failed: {0}")]
    List(#[from] ListError),

    /// Retrieval channel failed; the batch was rolled back to pending
    #[error("poll aborted, batch rolled back: {0}")]
    Retrieve(#[from] RetrieveError),

    /// The sink refused the unit; the batch was rolled back to pending
    #[error("poll aborted, dispatch failed: {0}")]
    Dispatch(#[from] DispatchError),
}

pub type Result<T> = std::result::Result<T, PollError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retrieve_error_kind() {
        assert!(!RetrieveError::entry("a.txt", "gone").is_channel());
        assert!(RetrieveError::Channel("reset".into()).is_channel());

        let err: RetrieveError = ConnectError::PoolClosed.into();
        assert!(err.is_channel());
    }

    #[test]
    fn test_error_messages() {
        let err = RetrieveError::entry("a.txt", "permission denied");
        assert_eq!(err.to_string(), "failed to retrieve 'a.txt': permission denied");

        let err = PollError::from(ListError::Protocol("bad reply".into()));
        assert!(err.to_string().contains("bad reply"));

        let err = ConfigError::InvalidBatchSize(0);
        assert!(err.to_string().contains("-1"));
    }
}
