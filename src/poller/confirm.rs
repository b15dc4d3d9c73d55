//! Confirmation path from the consumer back into the backlog.

use super::channel::DispatchUnit;
use crate::backlog::Backlog;
use std::sync::Arc;
use tracing::debug;

/// Releases dispatched entries once the consumer has accepted them.
///
/// Cheap to clone; hand one to every consumer task. There is no deadline: an
/// entry whose unit is never confirmed stays in flight.
#[derive(Debug, Clone)]
pub struct DispatchConfirmer {
    backlog: Arc<Backlog>,
}

impl DispatchConfirmer {
    pub fn new(backlog: Arc<Backlog>) -> Self {
        Self { backlog }
    }

    /// Mark `names` done. Repeated confirmations are no-ops. Returns how many
    /// names were still in flight.
    pub fn confirm<S: AsRef<str>>(&self, names: impl IntoIterator<Item = S>) -> usize {
        let released = self.backlog.mark_done(names);
        debug!("Confirmed {} entries", released);
        released
    }

    pub fn confirm_unit(&self, unit: &DispatchUnit) -> usize {
        self.confirm(&unit.names)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backlog::{BatchLimit, FileInfo, Snapshot};
    use chrono::{TimeZone, Utc};

    #[test]
    fn test_confirm_twice() {
        let backlog = Arc::new(Backlog::new());
        let mtime = Utc.timestamp_opt(1_700_000_000, 0).unwrap();
        let snapshot: Snapshot = ["a", "b"]
            .iter()
            .map(|name| FileInfo::new(*name, 1, mtime))
            .collect();
        backlog.reconcile(&snapshot);
        let batch = backlog.select_batch(BatchLimit::Unbounded);

        let confirmer = DispatchConfirmer::new(Arc::clone(&backlog));
        assert_eq!(confirmer.confirm(&batch), 2);
        assert_eq!(confirmer.confirm(&batch), 0);
        assert_eq!(confirmer.confirm(["never-seen"]), 0);
        assert_eq!(backlog.in_flight_len(), 0);
    }
}
