//! End-to-end backfill runs against an on-disk SQLite store.

use std::cell::Cell;
use std::path::Path;

use backfill_core::config::BackfillConfig;
use backfill_core::error::{Error, IntegrityError, PublishError, SourceError};
use backfill_core::fingerprint::fingerprint;
use backfill_core::model::{
    Container, ContainerId, Group, GroupId, MS_PER_DAY, Record, RecordId, Window, WindowSnapshot,
};
use backfill_core::orchestrator::StopSignal;
use backfill_core::publish::{
    AppendLogPublisher, EventStreamInsert, StreamLogReader, StreamPublisher, summarize_log,
};
use backfill_core::source::{PageQuery, RecordSource, SCHEMA_SQL, SqliteSource};
use backfill_core::{BackfillOrchestrator, BackfillState};
use rusqlite::{Connection, params};
use tempfile::TempDir;

const NOW: i64 = 1_700_000_000_000;

// =============================================================================
// Fixtures
// =============================================================================

struct Store {
    _dir: TempDir,
    conn: Connection,
    path: std::path::PathBuf,
}

impl Store {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("records.db");
        let conn = Connection::open(&path).unwrap();
        conn.execute_batch(SCHEMA_SQL).unwrap();
        conn.execute_batch(
            "INSERT INTO containers (id, slug, organization_id) VALUES (1, 'web', 1), (2, 'api', 1);
             INSERT INTO record_groups (id, container_id, title) VALUES
                 (10, 1, 'TypeError'), (20, 2, 'Timeout');",
        )
        .unwrap();
        Self {
            _dir: dir,
            conn,
            path,
        }
    }

    fn insert(&self, id: i64, container_id: i64, group_id: Option<i64>, ts: i64) {
        self.conn
            .execute(
                "INSERT INTO records (id, event_id, container_id, group_id, timestamp_ms, payload)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    id,
                    format!("ev-{id}"),
                    container_id,
                    group_id,
                    ts,
                    format!(r#"{{"message":"failure {}"}}"#, id % 7)
                ],
            )
            .unwrap();
    }

    /// `n` eligible records, ids 1..=n, alternating between the two containers.
    fn seed(&self, n: i64) {
        for id in 1..=n {
            let (container, group) = if id % 2 == 0 { (2, 20) } else { (1, 10) };
            self.insert(id, container, Some(group), NOW - MS_PER_DAY - id);
        }
    }

    fn open(&self) -> SqliteSource {
        SqliteSource::open(&self.path).unwrap()
    }

    fn path(&self) -> &Path {
        &self.path
    }
}

/// Counts calls on the wrapped source.
struct CountingSource<S> {
    inner: S,
    pages: Cell<usize>,
    container_lookups: Cell<usize>,
    group_lookups: Cell<usize>,
}

impl<S> CountingSource<S> {
    fn new(inner: S) -> Self {
        Self {
            inner,
            pages: Cell::new(0),
            container_lookups: Cell::new(0),
            group_lookups: Cell::new(0),
        }
    }
}

fn bump(c: &Cell<usize>) {
    c.set(c.get() + 1);
}

impl<S: RecordSource> RecordSource for CountingSource<S> {
    fn snapshot(&self, window: &Window) -> Result<WindowSnapshot, SourceError> {
        self.inner.snapshot(window)
    }

    fn count_after(
        &self,
        window: &Window,
        after_key: RecordId,
        upto_key: RecordId,
    ) -> Result<u64, SourceError> {
        self.inner.count_after(window, after_key, upto_key)
    }

    fn read_page(&self, query: &PageQuery) -> Result<Vec<Record>, SourceError> {
        bump(&self.pages);
        self.inner.read_page(query)
    }

    fn containers_by_id(&self, ids: &[ContainerId]) -> Result<Vec<Container>, SourceError> {
        bump(&self.container_lookups);
        self.inner.containers_by_id(ids)
    }

    fn groups_by_id(&self, ids: &[GroupId]) -> Result<Vec<Group>, SourceError> {
        bump(&self.group_lookups);
        self.inner.groups_by_id(ids)
    }
}

/// Records every insert; optionally rejects one record id.
#[derive(Default)]
struct RecordingPublisher {
    inserts: Vec<EventStreamInsert>,
    attempts: Vec<i64>,
    reject: Option<i64>,
    flushes: usize,
}

impl RecordingPublisher {
    fn rejecting(record_id: i64) -> Self {
        Self {
            reject: Some(record_id),
            ..Self::default()
        }
    }

    fn ids(&self) -> Vec<i64> {
        self.inserts.iter().map(EventStreamInsert::record_id).collect()
    }
}

impl StreamPublisher for RecordingPublisher {
    fn publish(&mut self, insert: &EventStreamInsert) -> Result<(), PublishError> {
        self.attempts.push(insert.record_id());
        if self.reject == Some(insert.record_id()) {
            return Err(PublishError::Unreachable("broker closed connection".to_string()));
        }
        self.inserts.push(insert.clone());
        Ok(())
    }

    fn flush(&mut self) -> Result<(), PublishError> {
        self.flushes += 1;
        Ok(())
    }
}

/// Raises the stop signal after the first flush.
struct StopAfterFirstPage {
    inner: RecordingPublisher,
    stop: StopSignal,
}

impl StreamPublisher for StopAfterFirstPage {
    fn publish(&mut self, insert: &EventStreamInsert) -> Result<(), PublishError> {
        self.inner.publish(insert)
    }

    fn flush(&mut self) -> Result<(), PublishError> {
        self.inner.flush()?;
        self.stop.raise();
        Ok(())
    }
}

fn config(page_size: usize) -> BackfillConfig {
    BackfillConfig {
        page_size,
        ..BackfillConfig::default()
    }
}

// =============================================================================
// Scenarios
// =============================================================================

#[test]
fn two_hundred_fifty_records_in_pages_of_one_hundred() {
    let store = Store::new();
    store.seed(250);
    let source = CountingSource::new(store.open());

    let mut orch = BackfillOrchestrator::new(config(100), &source, RecordingPublisher::default())
        .with_clock(|| NOW);
    let report = orch.run().unwrap();

    assert_eq!(report.outcome, BackfillState::Done);
    assert_eq!(report.progress.total, 250);
    assert_eq!(report.progress.pages, 3);
    assert_eq!(report.progress.published, 250);
    assert_eq!(source.pages.get(), 3);
    assert_eq!(source.container_lookups.get(), 3);
    assert_eq!(source.group_lookups.get(), 3);

    let publisher = orch.publisher();
    assert_eq!(publisher.ids(), (1..=250).collect::<Vec<_>>());
    assert_eq!(publisher.flushes, 3);
}

#[test]
fn published_inserts_carry_backfill_flags_and_fingerprint() {
    let store = Store::new();
    store.seed(5);
    let source = store.open();
    let mut orch =
        BackfillOrchestrator::new(config(2), &source, RecordingPublisher::default()).with_clock(|| NOW);
    orch.run().unwrap();

    for insert in &orch.publisher().inserts {
        assert!(!insert.is_new);
        assert!(!insert.is_regression);
        assert!(!insert.is_new_group_environment);
        assert!(insert.skip_consume);
        assert_eq!(insert.primary_hash, fingerprint(&insert.record));
        assert_eq!(insert.group.id, insert.record.group_id.unwrap());
        assert_eq!(insert.container.id, insert.record.container_id);
    }
}

#[test]
fn only_windowed_grouped_records_are_published() {
    let store = Store::new();
    store.insert(1, 1, Some(10), NOW - MS_PER_DAY);
    store.insert(2, 1, None, NOW - MS_PER_DAY); // ungrouped
    store.insert(3, 1, Some(10), NOW - 91 * MS_PER_DAY); // too old
    store.insert(4, 1, Some(10), NOW); // window end is exclusive
    store.insert(5, 2, Some(20), NOW - 89 * MS_PER_DAY);
    let source = store.open();

    let mut orch =
        BackfillOrchestrator::new(config(10), &source, RecordingPublisher::default()).with_clock(|| NOW);
    let report = orch.run().unwrap();
    assert_eq!(report.progress.total, 2);
    assert_eq!(orch.publisher().ids(), vec![1, 5]);
}

#[test]
fn configured_retention_narrows_window() {
    let store = Store::new();
    store.insert(1, 1, Some(10), NOW - 10 * MS_PER_DAY);
    store.insert(2, 1, Some(10), NOW - 2 * MS_PER_DAY);
    let source = store.open();

    let cfg = BackfillConfig {
        retention_days: Some(7),
        ..config(10)
    };
    let mut orch =
        BackfillOrchestrator::new(cfg, &source, RecordingPublisher::default()).with_clock(|| NOW);
    let report = orch.run().unwrap();
    assert_eq!(report.retention_days, Some(7));
    assert_eq!(orch.publisher().ids(), vec![2]);
}

#[test]
fn zero_matching_records_skips_without_publishing() {
    let store = Store::new();
    store.insert(1, 1, None, NOW - MS_PER_DAY);
    let source = CountingSource::new(store.open());

    let mut orch = BackfillOrchestrator::new(config(10), &source, RecordingPublisher::default())
        .with_clock(|| NOW);
    let report = orch.run().unwrap();
    assert_eq!(report.outcome, BackfillState::SkippedEmpty);
    assert_eq!(source.pages.get(), 0);
    assert!(orch.publisher().attempts.is_empty());
}

#[test]
fn skip_switch_reads_nothing() {
    let store = Store::new();
    store.seed(10);
    let source = CountingSource::new(store.open());
    let cfg = BackfillConfig {
        skip: true,
        ..config(10)
    };

    let mut orch =
        BackfillOrchestrator::new(cfg, &source, RecordingPublisher::default()).with_clock(|| NOW);
    assert_eq!(orch.run().unwrap().outcome, BackfillState::SkippedByFlag);
    assert_eq!(source.pages.get(), 0);
    assert_eq!(source.container_lookups.get(), 0);
    assert!(orch.publisher().attempts.is_empty());
}

#[test]
fn dangling_group_is_skipped_in_lenient_mode() {
    let store = Store::new();
    store.seed(6);
    store.insert(7, 1, Some(999), NOW - MS_PER_DAY);
    store.insert(8, 1, Some(10), NOW - MS_PER_DAY);
    let source = store.open();

    let mut orch =
        BackfillOrchestrator::new(config(3), &source, RecordingPublisher::default()).with_clock(|| NOW);
    let report = orch.run().unwrap();

    assert_eq!(report.outcome, BackfillState::Done);
    assert_eq!(report.progress.excluded, 1);
    assert_eq!(report.progress.published, 7);
    assert_eq!(orch.publisher().ids(), vec![1, 2, 3, 4, 5, 6, 8]);
}

#[test]
fn dangling_group_fails_in_strict_mode() {
    let store = Store::new();
    store.seed(6);
    store.insert(7, 1, Some(999), NOW - MS_PER_DAY);
    store.insert(8, 1, Some(10), NOW - MS_PER_DAY);
    let source = store.open();
    let cfg = BackfillConfig {
        strict_integrity: true,
        ..config(3)
    };

    let mut orch =
        BackfillOrchestrator::new(cfg, &source, RecordingPublisher::default()).with_clock(|| NOW);
    let failure = orch.run().unwrap_err();

    assert_eq!(orch.state(), BackfillState::Failed);
    assert!(matches!(
        failure.error,
        Error::DataIntegrity(IntegrityError::DanglingGroup {
            record_id: 7,
            group_id: 999
        })
    ));
    assert_eq!(failure.page, Some(2));
    assert_eq!(failure.record_id, Some(7));
    assert_eq!(failure.resume_after(), Some(6));
    assert_eq!(orch.publisher().ids(), vec![1, 2, 3, 4, 5, 6]);
}

#[test]
fn publish_failure_at_record_fifty_stops_the_run() {
    let store = Store::new();
    store.seed(120);
    let source = store.open();

    let mut orch =
        BackfillOrchestrator::new(config(100), &source, RecordingPublisher::rejecting(50))
            .with_clock(|| NOW);
    let failure = orch.run().unwrap_err();

    assert!(matches!(
        failure.error,
        Error::Publish(PublishError::Unreachable(_))
    ));
    assert!(failure.error.is_retryable_by_rerun());
    assert_eq!(failure.page, Some(0));
    assert_eq!(failure.record_id, Some(50));
    assert_eq!(failure.progress.published, 49);
    assert_eq!(failure.resume_after(), Some(49));

    let publisher = orch.publisher();
    assert_eq!(publisher.ids(), (1..=49).collect::<Vec<_>>());
    assert_eq!(*publisher.attempts.last().unwrap(), 50);
    assert_eq!(publisher.flushes, 0);
}

#[test]
fn stop_signal_halts_at_page_boundary() {
    let store = Store::new();
    store.seed(30);
    let source = store.open();
    let stop = StopSignal::new();
    let publisher = StopAfterFirstPage {
        inner: RecordingPublisher::default(),
        stop: stop.clone(),
    };

    let mut orch = BackfillOrchestrator::new(config(10), &source, publisher)
        .with_clock(|| NOW)
        .with_stop_signal(stop);
    let failure = orch.run().unwrap_err();

    assert!(matches!(failure.error, Error::Cancelled(_)));
    assert_eq!(failure.progress.pages, 1);
    assert_eq!(failure.resume_after(), Some(10));
    assert_eq!(orch.publisher().inner.ids(), (1..=10).collect::<Vec<_>>());
}

#[test]
fn resume_publishes_only_later_records() {
    let store = Store::new();
    store.seed(30);
    let source = store.open();

    let mut orch = BackfillOrchestrator::new(config(7), &source, RecordingPublisher::default())
        .with_clock(|| NOW)
        .resume_after(Some(22));
    let report = orch.run().unwrap();

    assert_eq!(report.outcome, BackfillState::Done);
    assert_eq!(report.progress.total, 30);
    assert_eq!(orch.publisher().ids(), (23..=30).collect::<Vec<_>>());
}

#[test]
fn failed_then_resumed_run_covers_window_once() {
    let store = Store::new();
    store.seed(40);
    let source = store.open();

    let mut first =
        BackfillOrchestrator::new(config(15), &source, RecordingPublisher::rejecting(18))
            .with_clock(|| NOW);
    let failure = first.run().unwrap_err();
    let resume = failure.resume_after();

    let mut second = BackfillOrchestrator::new(config(15), &source, RecordingPublisher::default())
        .with_clock(|| NOW)
        .resume_after(resume);
    second.run().unwrap();

    let mut all = first.publisher().ids();
    all.extend(second.publisher().ids());
    assert_eq!(all, (1..=40).collect::<Vec<_>>());
}

#[test]
fn corrupt_payload_fails_run_as_source_error() {
    let store = Store::new();
    store.seed(3);
    store
        .conn
        .execute(
            "INSERT INTO records (id, event_id, container_id, group_id, timestamp_ms, payload)
             VALUES (4, 'ev-4', 1, 10, ?1, 'not json')",
            params![NOW - MS_PER_DAY],
        )
        .unwrap();
    let source = store.open();

    let mut orch =
        BackfillOrchestrator::new(config(10), &source, RecordingPublisher::default()).with_clock(|| NOW);
    let failure = orch.run().unwrap_err();
    assert!(matches!(
        failure.error,
        Error::SourceUnavailable(SourceError::Corrupt { record_id: 4, .. })
    ));
    assert!(orch.publisher().attempts.is_empty());
}

#[test]
fn append_log_sink_end_to_end() {
    let store = Store::new();
    store.seed(12);
    let source = store.open();
    let log_path = store.path().with_file_name("stream.log");

    let publisher = AppendLogPublisher::open(&log_path, true).unwrap();
    let mut orch = BackfillOrchestrator::new(config(5), &source, publisher).with_clock(|| NOW);
    orch.run().unwrap();
    let publisher = orch.into_publisher();
    assert_eq!(publisher.frames_written(), 12);
    drop(publisher);

    let summary = summarize_log(&log_path).unwrap();
    assert_eq!(summary.frames, 12);
    assert_eq!(summary.first_record_id, Some(1));
    assert_eq!(summary.last_record_id, Some(12));

    let first = StreamLogReader::open(&log_path)
        .unwrap()
        .next_frame()
        .unwrap()
        .unwrap();
    assert!(first.insert.skip_consume);
    assert_eq!(first.insert.record.event_id, "ev-1");
}

#[cfg(target_os = "linux")]
#[test]
fn failing_append_log_never_reports_unwritten_records() {
    let store = Store::new();
    store.seed(100);
    let source = store.open();

    let publisher = AppendLogPublisher::open(Path::new("/dev/full"), false).unwrap();
    let mut orch = BackfillOrchestrator::new(config(50), &source, publisher).with_clock(|| NOW);
    let failure = orch.run().unwrap_err();

    assert!(matches!(failure.error, Error::Publish(PublishError::Io(_))));
    assert_eq!(failure.page, Some(0));
    assert_eq!(failure.record_id, Some(1));
    assert_eq!(failure.progress.published, 0);
    assert_eq!(failure.resume_after(), None);
}
