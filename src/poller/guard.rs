//! Rollback guard for a selected batch.

use crate::backlog::Backlog;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::warn;

/// Owns the in-flight names of one poll cycle until they are dispatched.
///
/// Dropping the guard puts every name it still owns back into pending. This
/// covers early returns on channel or dispatch failure as well as a cancelled
/// poll future. Call [`BatchGuard::defuse`] once the unit has been handed off.
pub(crate) struct BatchGuard {
    backlog: Arc<Backlog>,
    outstanding: BTreeSet<String>,
}

impl BatchGuard {
    pub(crate) fn new(backlog: Arc<Backlog>, names: impl IntoIterator<Item = String>) -> Self {
        Self {
            backlog,
            outstanding: names.into_iter().collect(),
        }
    }

    /// Return a single name to pending right away
    pub(crate) fn requeue(&mut self, name: &str) {
        if self.outstanding.remove(name) {
            self.backlog.requeue([name]);
        }
    }

    /// Leave the remaining names in flight
    pub(crate) fn defuse(mut self) {
        self.outstanding.clear();
    }
}

impl Drop for BatchGuard {
    fn drop(&mut self) {
        if self.outstanding.is_empty() {
            return;
        }
        let restored = self.backlog.requeue(&self.outstanding);
        warn!("Rolled back {} in-flight entries to pending", restored);
    }
}
