//! Change detection and dispatch bookkeeping.
//!
//! [`Snapshot`]s of the source are reconciled against the [`Backlog`], which
//! decides what is new or changed and tracks it until the consumer confirms it.

pub mod file_info;
pub mod state;

pub use file_info::{FileInfo, RawEntry, Snapshot};
pub use state::{Backlog, BacklogState, BatchLimit, ReconcileSummary, UNBOUNDED_SENTINEL};
