//! Backfill run state machine.
//!
//! ```text
//! Idle ─skip─────────────────────────────▶ SkippedByFlag
//!  │
//!  ▼
//! ComputingWindow ─count == 0────────────▶ SkippedEmpty
//!  │
//!  ▼
//! Iterating ─page → enrich → fingerprint → publish─▶ Done
//!  │
//!  └─any unrecovered error / stop signal─▶ Failed
//! ```
//!
//! Everything is sequential: one page at a time, one publish at a time. The
//! publisher is flushed at every page boundary and the stop signal is checked
//! before every page read, so a cancelled run always ends on a clean page
//! boundary with a resumable position.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Instant;

use serde::Serialize;
use thiserror::Error;
use tracing::{debug, error, info};

use crate::config::BackfillConfig;
use crate::enrich::Enricher;
use crate::error::{Error, Result};
use crate::fingerprint::fingerprint;
use crate::model::{RecordId, Window, effective_retention_days};
use crate::publish::{EventStreamInsert, StreamPublisher};
use crate::range::RangeIterator;
use crate::source::RecordSource;

/// Where a run is, or how it ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BackfillState {
    Idle,
    ComputingWindow,
    Iterating,
    Done,
    SkippedByFlag,
    SkippedEmpty,
    Failed,
}

impl BackfillState {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Idle => "idle",
            Self::ComputingWindow => "computing_window",
            Self::Iterating => "iterating",
            Self::Done => "done",
            Self::SkippedByFlag => "skipped_by_flag",
            Self::SkippedEmpty => "skipped_empty",
            Self::Failed => "failed",
        }
    }

    #[must_use]
    pub const fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Done | Self::SkippedByFlag | Self::SkippedEmpty | Self::Failed
        )
    }

    /// Terminal and not failed.
    #[must_use]
    pub const fn is_success(self) -> bool {
        matches!(self, Self::Done | Self::SkippedByFlag | Self::SkippedEmpty)
    }
}

impl fmt::Display for BackfillState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Counters shared across pages.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BackfillProgress {
    /// Eligible records in the window snapshot.
    pub total: u64,
    /// Pages fully published and flushed.
    pub pages: u64,
    pub records_read: u64,
    pub published: u64,
    /// Records left out for dangling references.
    pub excluded: u64,
    /// Last record handed to the stream, or the resume key if nothing has
    /// been published yet.
    pub last_published_id: Option<RecordId>,
}

/// Outcome of a successful (or skipped) run.
#[derive(Debug, Clone, Serialize)]
pub struct BackfillReport {
    pub outcome: BackfillState,
    /// Unset when the run was skipped before the window was computed.
    pub window: Option<Window>,
    pub retention_days: Option<u32>,
    pub progress: BackfillProgress,
    pub elapsed_ms: u64,
}

/// A failed run and where it stopped.
#[derive(Debug, Error)]
#[error("{error}")]
pub struct BackfillFailure {
    #[source]
    pub error: Error,
    /// Page being processed when the error occurred.
    pub page: Option<u64>,
    /// Record being handled when the error occurred.
    pub record_id: Option<RecordId>,
    pub window: Option<Window>,
    pub progress: BackfillProgress,
    pub elapsed_ms: u64,
}

impl BackfillFailure {
    /// Key to pass as `--resume-after` on the next run.
    #[must_use]
    pub fn resume_after(&self) -> Option<RecordId> {
        self.progress.last_published_id
    }
}

/// Cooperative stop flag, checked at every page boundary.
#[derive(Debug, Clone, Default)]
pub struct StopSignal(Arc<AtomicBool>);

impl StopSignal {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn raise(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    #[must_use]
    pub fn is_raised(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Epoch-millisecond clock.
pub type Clock = Box<dyn Fn() -> i64 + Send>;

fn epoch_ms_now() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

#[derive(Default)]
struct RunContext {
    window: Option<Window>,
    retention_days: Option<u32>,
    page: Option<u64>,
    record_id: Option<RecordId>,
    progress: BackfillProgress,
}

/// Drives one bounded backfill from a [`RecordSource`] into a
/// [`StreamPublisher`].
pub struct BackfillOrchestrator<S: RecordSource, P: StreamPublisher> {
    config: BackfillConfig,
    source: S,
    publisher: P,
    state: BackfillState,
    stop: StopSignal,
    clock: Clock,
    resume_after: Option<RecordId>,
}

impl<S: RecordSource, P: StreamPublisher> BackfillOrchestrator<S, P> {
    pub fn new(config: BackfillConfig, source: S, publisher: P) -> Self {
        Self {
            config,
            source,
            publisher,
            state: BackfillState::Idle,
            stop: StopSignal::new(),
            clock: Box::new(epoch_ms_now),
            resume_after: None,
        }
    }

    /// Share a stop flag with a signal handler.
    #[must_use]
    pub fn with_stop_signal(mut self, stop: StopSignal) -> Self {
        self.stop = stop;
        self
    }

    /// Replace the wall clock used to compute the window.
    #[must_use]
    pub fn with_clock(mut self, clock: impl Fn() -> i64 + Send + 'static) -> Self {
        self.clock = Box::new(clock);
        self
    }

    /// Skip every record with a key `<= key`.
    #[must_use]
    pub fn resume_after(mut self, key: Option<RecordId>) -> Self {
        self.resume_after = key;
        self
    }

    #[must_use]
    pub fn state(&self) -> BackfillState {
        self.state
    }

    #[must_use]
    pub fn stop_signal(&self) -> StopSignal {
        self.stop.clone()
    }

    pub fn publisher(&self) -> &P {
        &self.publisher
    }

    pub fn into_publisher(self) -> P {
        self.publisher
    }

    /// Run the backfill to a terminal state.
    pub fn run(&mut self) -> std::result::Result<BackfillReport, BackfillFailure> {
        let started = Instant::now();
        let mut ctx = RunContext::default();
        self.state = BackfillState::Idle;

        match self.execute(&mut ctx) {
            Ok(outcome) => {
                self.state = outcome;
                Ok(BackfillReport {
                    outcome,
                    window: ctx.window,
                    retention_days: ctx.retention_days,
                    progress: ctx.progress,
                    elapsed_ms: elapsed_ms(started),
                })
            }
            Err(err) => {
                self.state = BackfillState::Failed;
                error!(
                    page = ?ctx.page,
                    record_id = ?ctx.record_id,
                    published = ctx.progress.published,
                    resume_after = ?ctx.progress.last_published_id,
                    error = %err,
                    "Backfill failed"
                );
                Err(BackfillFailure {
                    error: err,
                    page: ctx.page,
                    record_id: ctx.record_id,
                    window: ctx.window,
                    progress: ctx.progress,
                    elapsed_ms: elapsed_ms(started),
                })
            }
        }
    }

    fn execute(&mut self, ctx: &mut RunContext) -> Result<BackfillState> {
        if skip_requested(&self.config) {
            return Ok(BackfillState::SkippedByFlag);
        }

        self.state = BackfillState::ComputingWindow;
        let retention_days = effective_retention_days(self.config.retention_days);
        let window = Window::from_retention((self.clock)(), retention_days);
        ctx.window = Some(window);
        ctx.retention_days = Some(retention_days);
        debug!(%window, retention_days, "Computed backfill window");

        let mut pages = RangeIterator::new(&self.source, window, self.config.page_size)?;
        if let Some(key) = self.resume_after {
            pages = pages.starting_after(key);
            ctx.progress.last_published_id = Some(key);
            info!(resume_after = key, "Resuming backfill");
        }

        let total = pages.total();
        ctx.progress.total = total;
        if total == 0 {
            info!("Nothing to do, skipping backfill");
            return Ok(BackfillState::SkippedEmpty);
        }
        if self.resume_after.is_some() {
            let remaining = pages.remaining()?;
            info!(total, remaining, "Events to process: {remaining} of {total}");
        } else {
            info!(total, "Events to process: {total}");
        }

        self.state = BackfillState::Iterating;
        let enricher = Enricher::new(self.config.strict_integrity);

        loop {
            if self.stop.is_raised() {
                return Err(Error::Cancelled(match ctx.progress.last_published_id {
                    Some(key) => format!("stop requested; resume after record {key}"),
                    None => "stop requested before the first publish".to_string(),
                }));
            }

            let Some(page) = pages.next() else { break };
            let page = page?;
            let index = page.index;
            ctx.page = Some(index);
            ctx.record_id = None;
            ctx.progress.records_read += page.len() as u64;

            let enriched = enricher
                .enrich(&self.source, page.records)
                .inspect_err(|err| {
                    if let Error::DataIntegrity(integrity) = err {
                        ctx.record_id = Some(integrity.record_id());
                    }
                })?;
            ctx.progress.excluded += enriched.excluded.len() as u64;

            for record in &enriched.records {
                ctx.record_id = Some(record.record.id);
                let insert = EventStreamInsert::backfill(record, fingerprint(&record.record));
                self.publisher.publish(&insert)?;
                ctx.progress.published += 1;
                ctx.progress.last_published_id = Some(record.record.id);
            }
            ctx.record_id = None;

            self.publisher.flush()?;
            ctx.progress.pages += 1;
            debug!(
                page = index,
                published = ctx.progress.published,
                total,
                "Page published"
            );
        }

        info!(
            published = ctx.progress.published,
            excluded = ctx.progress.excluded,
            pages = ctx.progress.pages,
            "Done"
        );
        Ok(BackfillState::Done)
    }
}

fn skip_requested(config: &BackfillConfig) -> bool {
    if config.skip {
        info!("Skipping backfill");
    }
    config.skip
}

/// Report for a run the skip switch turns off, or `None` when it is unset.
///
/// Lets a caller honor the switch before opening any source or sink.
pub fn skipped_by_flag(config: &BackfillConfig) -> Option<BackfillReport> {
    skip_requested(config).then(|| BackfillReport {
        outcome: BackfillState::SkippedByFlag,
        window: None,
        retention_days: None,
        progress: BackfillProgress::default(),
        elapsed_ms: 0,
    })
}

fn elapsed_ms(started: Instant) -> u64 {
    u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX)
}
