//! Polling cycle: list, reconcile, select, retrieve, dispatch.
//!
//! # Architecture
//!
//! ```text
//! +------------------+     +-----------+     +------------------+     +----------+
//! | SnapshotProvider | --> |  Backlog  | --> | ContentRetriever | --> |   Sink   |
//! |  (list source)   |     | (select)  |     |  (fetch bytes)   |     | (units)  |
//! +------------------+     +-----------+     +------------------+     +----------+
//!                                ^                                         |
//!                                +------------ DispatchConfirmer <---------+
//! ```
//!
//! Only the reconcile/select step touches the backlog lock. Listing and
//! retrieval run with it released, so confirmations interleave freely with a
//! running cycle.

pub mod channel;
pub mod confirm;
mod guard;

pub use channel::{
    dispatch_channel, ChannelSink, DispatchReceiver, DispatchSink, DispatchUnit, RetrievedEntry,
    DISPATCH_CHANNEL_SIZE,
};
pub use confirm::DispatchConfirmer;

use crate::backlog::{Backlog, BacklogState, ReconcileSummary};
use crate::config::PollerConfig;
use crate::error::{PollError, Result};
use crate::source::{ContentRetriever, SnapshotProvider};
use futures::stream::{self, StreamExt};
use guard::BatchGuard;
use serde::Serialize;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{watch, Mutex};
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// What a single poll cycle did
#[derive(Debug, Clone, Default, Serialize)]
pub struct PollReport {
    /// Entries in the listing
    pub listed: usize,
    /// Listing rows dropped as malformed
    pub skipped_malformed: usize,
    pub reconciled: ReconcileSummary,
    /// Names moved to in-flight this cycle
    pub selected: Vec<String>,
    /// Names handed to the sink, still in flight until confirmed
    pub dispatched: Vec<String>,
    /// Names returned to pending after an entry-level retrieval failure
    pub requeued: Vec<String>,
    pub failures: Vec<String>,
    pub bytes: u64,
    pub duration_ms: u64,
}

impl PollReport {
    /// Nothing was pending, so nothing was dispatched
    pub fn is_empty(&self) -> bool {
        self.selected.is_empty()
    }
}

/// Totals over the lifetime of [`PollingSource::run`]
#[derive(Debug, Clone, Default, Serialize)]
pub struct PollStats {
    pub cycles: u64,
    pub failed_cycles: u64,
    pub files_dispatched: u64,
    pub files_requeued: u64,
    pub bytes_dispatched: u64,
}

impl PollStats {
    fn record(&mut self, result: &Result<PollReport>) {
        self.cycles += 1;
        match result {
            Ok(report) => {
                self.files_dispatched += report.dispatched.len() as u64;
                self.files_requeued += report.requeued.len() as u64;
                self.bytes_dispatched += report.bytes;
            }
            Err(_) => self.failed_cycles += 1,
        }
    }
}

/// Polls one source and feeds new or changed entries to a sink
pub struct PollingSource {
    config: PollerConfig,
    backlog: Arc<Backlog>,
    provider: Arc<dyn SnapshotProvider>,
    retriever: Arc<dyn ContentRetriever>,
    sink: Arc<dyn DispatchSink>,
    // Held from listing until the batch is selected
    cycle_gate: Mutex<()>,
}

impl PollingSource {
    pub fn new(
        config: PollerConfig,
        provider: Arc<dyn SnapshotProvider>,
        retriever: Arc<dyn ContentRetriever>,
        sink: Arc<dyn DispatchSink>,
    ) -> Self {
        Self {
            config,
            backlog: Arc::new(Backlog::new()),
            provider,
            retriever,
            sink,
            cycle_gate: Mutex::new(()),
        }
    }

    pub fn config(&self) -> &PollerConfig {
        &self.config
    }

    pub fn backlog(&self) -> &Arc<Backlog> {
        &self.backlog
    }

    /// Confirmation handle for consumers of this source's units
    pub fn confirmer(&self) -> DispatchConfirmer {
        DispatchConfirmer::new(Arc::clone(&self.backlog))
    }

    pub fn state(&self) -> BacklogState {
        self.backlog.snapshot_state()
    }

    /// Run one poll cycle.
    ///
    /// On error the backlog is back where it was before the batch was
    /// selected: a failed listing changes nothing, a failed retrieval channel
    /// or a refused unit puts the whole batch back into pending. Dropping the
    /// returned future mid-cycle rolls back the same way.
    pub async fn poll(&self) -> Result<PollReport> {
        let started = Instant::now();
        let mut report = PollReport::default();

        let (batch, mut guard) = {
            let _gate = match self.config.allow_overlap() {
                true => None,
                false => Some(self.cycle_gate.lock().await),
            };

            let snapshot = self.provider.list().await.map_err(|e| {
                warn!("Listing failed, skipping cycle: {}", e);
                PollError::List(e)
            })?;

            let (summary, batch) = self
                .backlog
                .reconcile_and_select(&snapshot, self.config.max_batch_size());
            let guard = BatchGuard::new(
                Arc::clone(&self.backlog),
                batch.iter().map(|info| info.name().to_string()),
            );

            report.listed = snapshot.len();
            report.skipped_malformed = snapshot.skipped();
            report.reconciled = summary;
            (batch, guard)
        };

        report.selected = batch.iter().map(|info| info.name().to_string()).collect();
        if batch.is_empty() {
            debug!("Nothing pending ({} entries listed)", report.listed);
            report.duration_ms = started.elapsed().as_millis() as u64;
            return Ok(report);
        }
        debug!("Selected {} entries for retrieval", batch.len());

        let retriever = &self.retriever;
        let mut retrievals = stream::iter(batch.into_iter().map(|info| async move {
            let result = retriever.retrieve(info.name()).await;
            (info, result)
        }))
        .buffered(self.config.retrieve_concurrency().get());

        let mut payload = Vec::with_capacity(report.selected.len());
        while let Some((info, result)) = retrievals.next().await {
            match result {
                Ok(content) => payload.push(RetrievedEntry { info, content }),
                Err(e) if e.is_channel() => {
                    warn!("Retrieval channel failed, rolling back batch: {}", e);
                    return Err(PollError::Retrieve(e));
                }
                Err(e) => {
                    warn!("Requeueing {}: {}", info.name(), e);
                    guard.requeue(info.name());
                    report.requeued.push(info.name().to_string());
                    report.failures.push(e.to_string());
                }
            }
        }
        drop(retrievals);

        if payload.is_empty() {
            report.duration_ms = started.elapsed().as_millis() as u64;
            return Ok(report);
        }

        let unit = DispatchUnit::new(payload);
        report.dispatched = unit.names.clone();
        report.bytes = unit.total_bytes();

        self.sink.dispatch(unit).await.map_err(|e| {
            warn!("Dispatch refused, rolling back batch: {}", e);
            PollError::Dispatch(e)
        })?;
        guard.defuse();

        report.duration_ms = started.elapsed().as_millis() as u64;
        info!(
            "Dispatched {} entries ({} bytes), {} requeued, {} pending",
            report.dispatched.len(),
            report.bytes,
            report.requeued.len(),
            self.backlog.pending_len()
        );
        Ok(report)
    }

    /// Poll every `poll_interval` until `shutdown` turns true or its sender is
    /// dropped. A cycle interrupted by shutdown is rolled back.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> PollStats {
        let mut stats = PollStats::default();
        let mut ticker = tokio::time::interval(self.config.poll_interval());
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            "Polling every {:?} (batch limit {})",
            self.config.poll_interval(),
            self.config.max_batch_size().as_raw()
        );

        loop {
            tokio::select! {
                _ = ticker.tick() => {}
                _ = shutdown_requested(&mut shutdown) => break,
            }

            tokio::select! {
                result = self.poll() => {
                    if let Err(e) = &result {
                        warn!("Poll cycle failed: {}", e);
                    }
                    stats.record(&result);
                }
                _ = shutdown_requested(&mut shutdown) => {
                    info!("Shutdown requested during poll cycle");
                    break;
                }
            }
        }

        info!(
            "Poller stopped after {} cycles ({} failed), {} entries dispatched",
            stats.cycles, stats.failed_cycles, stats.files_dispatched
        );
        stats
    }
}

/// Resolves once the flag is set or every sender is gone
async fn shutdown_requested(rx: &mut watch::Receiver<bool>) {
    loop {
        let stop = *rx.borrow_and_update();
        if stop || rx.changed().await.is_err() {
            return;
        }
    }
}
