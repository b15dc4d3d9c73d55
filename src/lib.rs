//! dirpoll - polling file ingestion.
//!
//! Periodically lists a directory-like source, detects new and changed
//! entries, retrieves them in bounded batches and hands each batch to a
//! consumer exactly once per observed version.
//!
//! ```text
//!   list        reconcile + select       retrieve          dispatch
//! source ---> Snapshot ---> Backlog ---> ContentRetriever ---> DispatchSink
//!                             ^                                    |
//!                             +------- DispatchConfirmer <---------+
//! ```
//!
//! An entry stays in flight from selection until the consumer confirms its
//! unit and is never selected twice in the meantime.

pub mod backlog;
pub mod config;
pub mod error;
pub mod poller;
pub mod source;
pub mod store;

pub use backlog::{Backlog, BacklogState, BatchLimit, FileInfo, RawEntry, Snapshot};
pub use config::PollerConfig;
pub use error::{ListError, MalformedEntryError, PollError, RetrieveError};
pub use poller::{
    dispatch_channel, DispatchConfirmer, DispatchSink, DispatchUnit, PollReport, PollStats,
    PollingSource, RetrievedEntry,
};
pub use source::{ContentRetriever, PooledSource, SnapshotProvider};
pub use store::LocalStore;
