//! Poll cycle behavior against an in-memory source
//!
//! Covers the failure paths: per-entry requeue, channel rollback, listing
//! failure, refused dispatch and cancellation.

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, TimeZone, Utc};
use dirpoll::backlog::{BatchLimit, RawEntry};
use dirpoll::error::{ListError, PollError, RetrieveError};
use dirpoll::poller::{dispatch_channel, DispatchReceiver};
use dirpoll::{ContentRetriever, PollerConfig, PollingSource, Snapshot, SnapshotProvider};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

fn ts(secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(secs, 0).unwrap()
}

#[derive(Clone, Copy)]
enum Failure {
    Entry,
    Channel,
}

/// Scriptable source: files, listing failures, per-entry failures and entries
/// whose retrieval never completes
#[derive(Default)]
struct FakeSource {
    files: Mutex<BTreeMap<String, (Bytes, i64)>>,
    malformed: Mutex<Vec<String>>,
    list_fails: AtomicBool,
    failing: Mutex<HashMap<String, Failure>>,
    stalled: Mutex<HashSet<String>>,
}

impl FakeSource {
    fn with_files(names: &[&str]) -> Arc<Self> {
        let source = Arc::new(Self::default());
        for name in names {
            source.put(name, &format!("content of {}", name), 1_000);
        }
        source
    }

    fn put(&self, name: &str, content: &str, mtime: i64) {
        self.files.lock().unwrap().insert(
            name.to_string(),
            (Bytes::from(content.to_string()), mtime),
        );
    }

    fn fail(&self, name: &str, failure: Failure) {
        self.failing.lock().unwrap().insert(name.to_string(), failure);
    }

    fn heal(&self, name: &str) {
        self.failing.lock().unwrap().remove(name);
    }

    fn stall(&self, name: &str) {
        self.stalled.lock().unwrap().insert(name.to_string());
    }
}

#[async_trait]
impl SnapshotProvider for FakeSource {
    async fn list(&self) -> Result<Snapshot, ListError> {
        if self.list_fails.load(Ordering::SeqCst) {
            return Err(ListError::Protocol("421 service not available".into()));
        }

        let mut rows: Vec<RawEntry> = self
            .files
            .lock()
            .unwrap()
            .iter()
            .map(|(name, (content, mtime))| {
                RawEntry::new(name.clone(), content.len() as i64, ts(*mtime))
            })
            .collect();
        for name in self.malformed.lock().unwrap().iter() {
            rows.push(RawEntry {
                name: name.clone(),
                size: None,
                modified_at: None,
            });
        }
        Ok(Snapshot::from_rows(rows))
    }
}

#[async_trait]
impl ContentRetriever for FakeSource {
    async fn retrieve(&self, name: &str) -> Result<Bytes, RetrieveError> {
        let stalled = self.stalled.lock().unwrap().contains(name);
        if stalled {
            std::future::pending::<()>().await;
        }

        let failure = self.failing.lock().unwrap().get(name).copied();
        match failure {
            Some(Failure::Entry) => Err(RetrieveError::entry(name, "550 permission denied")),
            Some(Failure::Channel) => Err(RetrieveError::Channel("connection reset".into())),
            None => self
                .files
                .lock()
                .unwrap()
                .get(name)
                .map(|(content, _)| content.clone())
                .ok_or_else(|| RetrieveError::entry(name, "550 no such file")),
        }
    }
}

fn poller_for(source: &Arc<FakeSource>, max_batch_size: i64) -> (PollingSource, DispatchReceiver) {
    let (sink, rx) = dispatch_channel(16);
    let poller = PollingSource::new(
        PollerConfig::new(max_batch_size).unwrap(),
        source.clone(),
        source.clone(),
        Arc::new(sink),
    );
    (poller, rx)
}

#[tokio::test]
async fn test_batch_with_one_failed_retrieval() {
    let source = FakeSource::with_files(&["a", "b", "c"]);
    source.fail("b", Failure::Entry);
    let (poller, mut rx) = poller_for(&source, 2);

    let report = poller.poll().await.unwrap();
    assert_eq!(report.selected, vec!["a", "b"]);
    assert_eq!(report.dispatched, vec!["a"]);
    assert_eq!(report.requeued, vec!["b"]);
    assert_eq!(report.failures.len(), 1);

    let state = poller.state();
    assert_eq!(state.pending, vec!["b", "c"]);
    assert_eq!(state.in_flight, vec!["a"]);

    let unit = rx.recv().await.unwrap();
    assert_eq!(unit.names, vec!["a"]);
    assert_eq!(unit.payload[0].content, Bytes::from("content of a"));

    assert_eq!(poller.confirmer().confirm_unit(&unit), 1);
    assert!(poller.state().in_flight.is_empty());

    // The failed entry is retried on the next cycle
    source.heal("b");
    let report = poller.poll().await.unwrap();
    assert_eq!(report.dispatched, vec!["b", "c"]);
}

#[tokio::test]
async fn test_listing_failure_leaves_state_untouched() {
    let source = FakeSource::with_files(&["a", "b", "c"]);
    let (poller, _rx) = poller_for(&source, 1);
    poller.poll().await.unwrap();
    source.put("d", "new", 2_000);

    let before = poller.state();
    source.list_fails.store(true, Ordering::SeqCst);

    let err = poller.poll().await.unwrap_err();
    assert!(matches!(err, PollError::List(_)));
    assert_eq!(poller.state(), before);

    // Next tick recovers
    source.list_fails.store(false, Ordering::SeqCst);
    let report = poller.poll().await.unwrap();
    assert_eq!(report.reconciled.new, 1);
}

#[tokio::test]
async fn test_channel_failure_rolls_back_batch() {
    let source = FakeSource::with_files(&["a", "b", "c"]);
    source.fail("c", Failure::Channel);
    let (poller, mut rx) = poller_for(&source, -1);

    let err = poller.poll().await.unwrap_err();
    assert!(matches!(err, PollError::Retrieve(RetrieveError::Channel(_))));

    let state = poller.state();
    assert_eq!(state.pending, vec!["a", "b", "c"]);
    assert!(state.in_flight.is_empty());
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_no_duplicate_dispatch_while_in_flight() {
    let source = FakeSource::with_files(&["a"]);
    let (poller, mut rx) = poller_for(&source, -1);

    assert_eq!(poller.poll().await.unwrap().dispatched, vec!["a"]);
    let unit = rx.recv().await.unwrap();

    // Unconfirmed: nothing is selected again, whatever the listing says
    let report = poller.poll().await.unwrap();
    assert!(report.is_empty());
    source.put("a", "changed while in flight", 2_000);
    let report = poller.poll().await.unwrap();
    assert!(report.is_empty());
    assert_eq!(report.reconciled.deferred, 1);
    assert!(rx.try_recv().is_err());

    // Once confirmed, the newer version goes out
    poller.confirmer().confirm(&unit.names);
    let report = poller.poll().await.unwrap();
    assert_eq!(report.dispatched, vec!["a"]);
    let unit = rx.recv().await.unwrap();
    assert_eq!(
        unit.payload[0].content,
        Bytes::from("changed while in flight")
    );
}

#[tokio::test]
async fn test_changed_entry_redispatched() {
    let source = FakeSource::with_files(&["a"]);
    let (poller, mut rx) = poller_for(&source, -1);

    poller.poll().await.unwrap();
    poller.confirmer().confirm_unit(&rx.recv().await.unwrap());

    // Unchanged listing: nothing to do
    assert!(poller.poll().await.unwrap().is_empty());

    source.put("a", "a longer body than before", 1_000);
    let report = poller.poll().await.unwrap();
    assert_eq!(report.reconciled.changed, 1);
    assert_eq!(report.dispatched, vec!["a"]);
}

#[tokio::test]
async fn test_refused_dispatch_rolls_back() {
    let source = FakeSource::with_files(&["a", "b"]);
    let (poller, rx) = poller_for(&source, -1);
    drop(rx);

    let err = poller.poll().await.unwrap_err();
    assert!(matches!(err, PollError::Dispatch(_)));

    let state = poller.state();
    assert_eq!(state.pending, vec!["a", "b"]);
    assert!(state.in_flight.is_empty());
}

#[tokio::test]
async fn test_cancelled_poll_rolls_back() {
    let source = FakeSource::with_files(&["a", "b"]);
    source.stall("b");
    let (poller, _rx) = poller_for(&source, -1);

    let result = tokio::time::timeout(Duration::from_millis(50), poller.poll()).await;
    assert!(result.is_err(), "poll should still be waiting on 'b'");

    let state = poller.state();
    assert_eq!(state.pending, vec!["a", "b"]);
    assert!(state.in_flight.is_empty());
}

#[tokio::test]
async fn test_empty_source() {
    let source = Arc::new(FakeSource::default());
    let (poller, mut rx) = poller_for(&source, 5);

    let report = poller.poll().await.unwrap();
    assert!(report.is_empty());
    assert_eq!(report.listed, 0);
    assert!(rx.try_recv().is_err());
}

#[tokio::test]
async fn test_malformed_rows_skipped() {
    let source = FakeSource::with_files(&["good"]);
    source.malformed.lock().unwrap().push("broken".to_string());
    let (poller, _rx) = poller_for(&source, -1);

    let report = poller.poll().await.unwrap();
    assert_eq!(report.skipped_malformed, 1);
    assert_eq!(report.dispatched, vec!["good"]);

    let state = poller.state();
    assert!(!state.known.contains_key("broken"));
    assert!(!state.is_pending("broken"));
}

#[tokio::test]
async fn test_concurrent_polls_select_disjoint_batches() {
    let source = FakeSource::with_files(&["a", "b", "c", "d"]);
    let (poller, _rx) = poller_for(&source, 2);

    let (first, second) = tokio::join!(poller.poll(), poller.poll());
    let mut all: Vec<String> = first.unwrap().selected;
    all.extend(second.unwrap().selected);
    all.sort();

    assert_eq!(all, vec!["a", "b", "c", "d"]);
    assert_eq!(poller.state().in_flight.len(), 4);
}

#[tokio::test]
async fn test_concurrent_retrieval_keeps_selection_order() {
    let source = FakeSource::with_files(&["a", "b", "c", "d", "e"]);
    let (sink, mut rx) = dispatch_channel(4);
    let config = PollerConfig::new(-1)
        .unwrap()
        .with_retrieve_concurrency(3)
        .unwrap();
    assert_eq!(config.max_batch_size(), BatchLimit::Unbounded);
    let poller = PollingSource::new(config, source.clone(), source.clone(), Arc::new(sink));

    poller.poll().await.unwrap();
    let unit = rx.recv().await.unwrap();
    assert_eq!(unit.names, vec!["a", "b", "c", "d", "e"]);
}

#[tokio::test]
async fn test_run_until_shutdown() {
    let source = FakeSource::with_files(&["a"]);
    let (sink, mut rx) = dispatch_channel(4);
    let config = PollerConfig::new(-1)
        .unwrap()
        .with_poll_interval(Duration::from_millis(10))
        .unwrap();
    let poller = Arc::new(PollingSource::new(
        config,
        source.clone(),
        source.clone(),
        Arc::new(sink),
    ));
    let confirmer = poller.confirmer();

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = {
        let poller = Arc::clone(&poller);
        tokio::spawn(async move { poller.run(shutdown_rx).await })
    };

    let unit = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    confirmer.confirm_unit(&unit);

    shutdown_tx.send(true).unwrap();
    let stats = handle.await.unwrap();

    assert!(stats.cycles >= 1);
    assert_eq!(stats.files_dispatched, 1);
    assert!(poller.state().in_flight.is_empty());
}

#[tokio::test]
async fn test_run_with_default_config() {
    let source = FakeSource::with_files(&["a"]);
    let (sink, mut rx) = dispatch_channel(4);
    let config = PollerConfig::default();
    assert!(!config.poll_interval().is_zero());
    assert!(config
        .clone()
        .with_poll_interval(Duration::ZERO)
        .is_err());

    let poller = Arc::new(PollingSource::new(
        config,
        source.clone(),
        source.clone(),
        Arc::new(sink),
    ));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handle = {
        let poller = Arc::clone(&poller);
        tokio::spawn(async move { poller.run(shutdown_rx).await })
    };

    // First tick fires immediately
    let unit = tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(unit.names, vec!["a"]);

    shutdown_tx.send(true).unwrap();
    let stats = handle.await.unwrap();
    assert_eq!(stats.failed_cycles, 0);
}
