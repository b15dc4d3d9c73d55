// Backlog ledger
//
// Tracks every entry the poller has seen and where it is in the dispatch
// lifecycle:
//
//    reconcile          select_batch           mark_done
//   ----------> pending ------------> in_flight ----------> done
//                  ^                      |
//                  +------- requeue ------+   (retrieval rollback only)
//
// All partition transitions happen under a single mutex. No I/O in here.

use super::file_info::{FileInfo, Snapshot};
use crate::error::ConfigError;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::num::NonZeroUsize;
use std::sync::{Mutex, MutexGuard, PoisonError};
use tracing::debug;

/// Raw configuration value meaning "no batch limit"
pub const UNBOUNDED_SENTINEL: i64 = -1;

/// Upper bound on the number of entries selected per poll cycle
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BatchLimit {
    #[default]
    Unbounded,
    AtMost(NonZeroUsize),
}

impl BatchLimit {
    /// Parse a configured batch size. Only positive values and the `-1`
    /// sentinel are accepted.
    pub fn from_raw(raw: i64) -> Result<Self, ConfigError> {
        match raw {
            UNBOUNDED_SENTINEL => Ok(BatchLimit::Unbounded),
            n if n > 0 => usize::try_from(n)
                .ok()
                .and_then(NonZeroUsize::new)
                .map(BatchLimit::AtMost)
                .ok_or(ConfigError::InvalidBatchSize(raw)),
            _ => Err(ConfigError::InvalidBatchSize(raw)),
        }
    }

    /// Limit for a single selection call; zero means unbounded
    pub fn at_most(n: usize) -> Self {
        NonZeroUsize::new(n).map_or(BatchLimit::Unbounded, BatchLimit::AtMost)
    }

    pub fn as_raw(&self) -> i64 {
        match self {
            BatchLimit::Unbounded => UNBOUNDED_SENTINEL,
            BatchLimit::AtMost(n) => i64::try_from(n.get()).unwrap_or(i64::MAX),
        }
    }

    fn take(&self, available: usize) -> usize {
        match self {
            BatchLimit::Unbounded => available,
            BatchLimit::AtMost(n) => n.get().min(available),
        }
    }
}

/// What one reconciliation found
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ReconcileSummary {
    /// Names never seen before
    pub new: usize,
    /// Known names whose size or modification time moved
    pub changed: usize,
    pub unchanged: usize,
    /// Changes to entries still awaiting confirmation; picked up again after
    /// `mark_done`
    pub deferred: usize,
}

impl ReconcileSummary {
    pub fn detected(&self) -> usize {
        self.new + self.changed
    }
}

/// Read-only copy of the three partitions
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BacklogState {
    pub known: BTreeMap<String, FileInfo>,
    pub pending: Vec<String>,
    pub in_flight: Vec<String>,
}

impl BacklogState {
    pub fn is_pending(&self, name: &str) -> bool {
        self.pending.iter().any(|n| n == name)
    }

    pub fn is_in_flight(&self, name: &str) -> bool {
        self.in_flight.iter().any(|n| n == name)
    }
}

#[derive(Debug, Default)]
struct Partitions {
    known: HashMap<String, FileInfo>,
    // Ordered sets: selection is lexicographic and reproducible
    pending: BTreeSet<String>,
    in_flight: BTreeSet<String>,
}

enum Observation {
    New,
    Changed,
    Unchanged,
}

impl Partitions {
    fn reconcile(&mut self, snapshot: &Snapshot) -> ReconcileSummary {
        let mut summary = ReconcileSummary::default();

        for info in snapshot {
            let name = info.name();
            let observation = match self.known.get(name) {
                None => Observation::New,
                Some(known) if known.differs_from(info) => Observation::Changed,
                Some(_) => Observation::Unchanged,
            };

            match observation {
                Observation::Unchanged => {
                    summary.unchanged += 1;
                    continue;
                }
                // Keep the dispatched version in `known` so the change still
                // shows up once the outstanding dispatch is confirmed
                _ if self.in_flight.contains(name) => {
                    debug!("Deferring change to in-flight entry {}", name);
                    summary.deferred += 1;
                    continue;
                }
                Observation::New => summary.new += 1,
                Observation::Changed => summary.changed += 1,
            }

            self.known.insert(name.to_string(), info.clone());
            if self.pending.insert(name.to_string()) {
                debug!("Queued {} ({} bytes)", name, info.size());
            }
        }

        summary
    }

    fn select(&mut self, limit: BatchLimit) -> Vec<String> {
        let count = limit.take(self.pending.len());
        let mut selected = Vec::with_capacity(count);
        while selected.len() < count {
            let Some(name) = self.pending.pop_first() else {
                break;
            };
            self.in_flight.insert(name.clone());
            selected.push(name);
        }
        selected
    }

    fn mark_done<S: AsRef<str>>(&mut self, names: impl IntoIterator<Item = S>) -> usize {
        let mut released = 0;
        for name in names {
            let name: &str = name.as_ref();
            if self.in_flight.remove(name) {
                debug!("Confirmed {}", name);
                released += 1;
            }
        }
        released
    }

    fn requeue<S: AsRef<str>>(&mut self, names: impl IntoIterator<Item = S>) -> usize {
        let mut restored = 0;
        for name in names {
            let name: &str = name.as_ref();
            if self.in_flight.remove(name) {
                self.pending.insert(name.to_string());
                restored += 1;
            }
        }
        restored
    }
}

/// In-memory ledger of known, pending and in-flight entries.
///
/// Shared between the poll loop and the consumer's confirmation path; every
/// method takes `&self` and locks internally.
#[derive(Debug, Default)]
pub struct Backlog {
    partitions: Mutex<Partitions>,
}

impl Backlog {
    pub fn new() -> Self {
        Self::default()
    }

    // Every transition is total over the partitions, so a panic elsewhere
    // cannot leave them half-updated. Recover the guard instead of failing.
    fn lock(&self) -> MutexGuard<'_, Partitions> {
        self.partitions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// Record new and changed entries and queue them for dispatch.
    ///
    /// Entries missing from `snapshot` are left alone; nothing is ever
    /// removed from the known set.
    pub fn reconcile(&self, snapshot: &Snapshot) -> ReconcileSummary {
        self.lock().reconcile(snapshot)
    }

    /// Move up to `limit` pending names to in-flight, in lexicographic order.
    pub fn select_batch(&self, limit: BatchLimit) -> Vec<String> {
        self.lock().select(limit)
    }

    /// Reconcile and select as one atomic step, so two concurrent pollers can
    /// never select overlapping batches.
    pub fn reconcile_and_select(
        &self,
        snapshot: &Snapshot,
        limit: BatchLimit,
    ) -> (ReconcileSummary, Vec<FileInfo>) {
        let mut partitions = self.lock();
        let summary = partitions.reconcile(snapshot);
        let selected = partitions.select(limit);
        let batch = selected
            .iter()
            .filter_map(|name| partitions.known.get(name).cloned())
            .collect();
        (summary, batch)
    }

    /// Release confirmed names from in-flight. Names that are not in flight
    /// are ignored, so duplicate confirmations are harmless.
    ///
    /// Returns how many names were actually released.
    pub fn mark_done<S: AsRef<str>>(&self, names: impl IntoIterator<Item = S>) -> usize {
        self.lock().mark_done(names)
    }

    /// Put in-flight names back into pending after a failed or cancelled
    /// retrieval. Returns how many names were restored.
    pub fn requeue<S: AsRef<str>>(&self, names: impl IntoIterator<Item = S>) -> usize {
        self.lock().requeue(names)
    }

    pub fn snapshot_state(&self) -> BacklogState {
        let partitions = self.lock();
        BacklogState {
            known: partitions
                .known
                .iter()
                .map(|(name, info)| (name.clone(), info.clone()))
                .collect(),
            pending: partitions.pending.iter().cloned().collect(),
            in_flight: partitions.in_flight.iter().cloned().collect(),
        }
    }

    pub fn pending_len(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn in_flight_len(&self) -> usize {
        self.lock().in_flight.len()
    }
}
