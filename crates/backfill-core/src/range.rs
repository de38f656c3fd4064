//! Keyset-paginated traversal of a fixed window.
//!
//! The matching set is summarised once ([`WindowSnapshot`]) before the first
//! page is read. Every page then reads `id > last_key AND id <= max_key`, so
//! memory and per-read work stay bounded by the page size and records appended
//! after the snapshot are never visited.

use tracing::{debug, warn};

use crate::error::{ConfigError, Result};
use crate::model::{Page, RecordId, Window, WindowSnapshot};
use crate::source::{PageQuery, RecordSource};

/// Lazy, restartable sequence of [`Page`]s over a window.
///
/// Yields `Err` at most once: after a source failure the iterator is fused
/// and returns `None`.
pub struct RangeIterator<S: RecordSource> {
    source: S,
    window: Window,
    page_size: usize,
    snapshot: WindowSnapshot,
    last_key: Option<RecordId>,
    next_index: u64,
    done: bool,
}

impl<S: RecordSource> RangeIterator<S> {
    /// Take the window snapshot and position before the first record.
    pub fn new(source: S, window: Window, page_size: usize) -> Result<Self> {
        if page_size == 0 {
            return Err(ConfigError::ValidationError("page_size must be >= 1".to_string()).into());
        }
        if !window.is_valid() {
            return Err(ConfigError::ValidationError(format!(
                "window start {} is after window end {}",
                window.from_ms, window.to_ms
            ))
            .into());
        }

        let snapshot = source.snapshot(&window)?;
        debug!(
            count = snapshot.count,
            max_key = ?snapshot.max_key,
            "Took window snapshot"
        );

        Ok(Self {
            source,
            window,
            page_size,
            done: snapshot.max_key.is_none(),
            snapshot,
            last_key: None,
            next_index: 0,
        })
    }

    /// Resume traversal after `key` (exclusive).
    ///
    /// `total()` keeps reporting the whole window; [`RangeIterator::remaining`]
    /// counts what is left after `key`.
    #[must_use]
    pub fn starting_after(mut self, key: RecordId) -> Self {
        self.last_key = Some(key);
        if self.snapshot.max_key.is_some_and(|max| key >= max) {
            self.done = true;
        }
        self
    }

    /// Number of matching records in the window, queried once up front.
    #[must_use]
    pub fn total(&self) -> u64 {
        self.snapshot.count
    }

    #[must_use]
    pub fn snapshot(&self) -> WindowSnapshot {
        self.snapshot
    }

    #[must_use]
    pub fn window(&self) -> Window {
        self.window
    }

    /// Key of the last record handed out, i.e. the resume position.
    #[must_use]
    pub fn position(&self) -> Option<RecordId> {
        self.last_key
    }

    /// Whether the traversal is exhausted.
    #[must_use]
    pub fn is_done(&self) -> bool {
        self.done
    }

    /// Records still to come, up to the snapshot high-water mark.
    ///
    /// Free before traversal starts; after a resume or a handed-out page it
    /// costs one count query.
    pub fn remaining(&self) -> Result<u64> {
        match (self.done, self.last_key, self.snapshot.max_key) {
            (true, _, _) | (_, _, None) => Ok(0),
            (false, None, Some(_)) => Ok(self.snapshot.count),
            (false, Some(after), Some(upto)) => {
                Ok(self.source.count_after(&self.window, after, upto)?)
            }
        }
    }

    /// The source being traversed.
    pub fn source(&self) -> &S {
        &self.source
    }

    fn fetch(&mut self) -> Result<Option<Page>> {
        let Some(upto_key) = self.snapshot.max_key else {
            return Ok(None);
        };

        let records = self.source.read_page(&PageQuery {
            window: self.window,
            after_key: self.last_key,
            upto_key,
            limit: self.page_size,
        })?;

        if records.is_empty() {
            return Ok(None);
        }

        let page = Page {
            index: self.next_index,
            records,
        };
        self.next_index += 1;
        self.last_key = page.last_key();

        if page.len() < self.page_size || self.last_key.is_some_and(|k| k >= upto_key) {
            self.done = true;
        }
        Ok(Some(page))
    }
}

impl<S: RecordSource> Iterator for RangeIterator<S> {
    type Item = Result<Page>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.fetch() {
            Ok(Some(page)) => Some(Ok(page)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(err) => {
                warn!(after_key = ?self.last_key, error = %err, "Page read failed; halting traversal");
                self.done = true;
                Some(Err(err))
            }
        }
    }
}
