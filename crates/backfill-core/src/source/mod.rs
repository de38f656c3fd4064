//! Upstream record store boundary.
//!
//! A source exposes exactly what the pipeline needs: a count of matching
//! records taken once up front, an ordered keyset-paged read, and batched
//! lookups for containers and groups. The bundled backend is SQLite.

mod sqlite;

pub use sqlite::{SCHEMA_SQL, SqliteSource};

use crate::error::SourceError;
use crate::model::{Container, ContainerId, Group, GroupId, Record, RecordId, Window, WindowSnapshot};

/// One keyset page request.
///
/// Matches `timestamp ∈ [window.from, window.to) AND group_id IS NOT NULL`,
/// restricted to `after_key < id <= upto_key`, ordered by `id`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PageQuery {
    pub window: Window,
    /// Exclusive lower bound on the primary key.
    pub after_key: Option<RecordId>,
    /// Inclusive upper bound on the primary key (snapshot high-water mark).
    pub upto_key: RecordId,
    pub limit: usize,
}

/// Read-only access to the historical record store.
///
/// The trait is synchronous; callers in async contexts run the pipeline on
/// a blocking thread.
pub trait RecordSource {
    /// Count and highest key of eligible records in `window`.
    fn snapshot(&self, window: &Window) -> Result<WindowSnapshot, SourceError>;

    /// Count eligible records in `window` with `after_key < id <= upto_key`.
    fn count_after(
        &self,
        window: &Window,
        after_key: RecordId,
        upto_key: RecordId,
    ) -> Result<u64, SourceError>;

    /// Read the next page of eligible records.
    fn read_page(&self, query: &PageQuery) -> Result<Vec<Record>, SourceError>;

    /// Batched container lookup. Missing ids are simply absent from the result.
    fn containers_by_id(&self, ids: &[ContainerId]) -> Result<Vec<Container>, SourceError>;

    /// Batched group lookup. Missing ids are simply absent from the result.
    fn groups_by_id(&self, ids: &[GroupId]) -> Result<Vec<Group>, SourceError>;
}

impl<S: RecordSource + ?Sized> RecordSource for &S {
    fn snapshot(&self, window: &Window) -> Result<WindowSnapshot, SourceError> {
        (**self).snapshot(window)
    }

    fn count_after(
        &self,
        window: &Window,
        after_key: RecordId,
        upto_key: RecordId,
    ) -> Result<u64, SourceError> {
        (**self).count_after(window, after_key, upto_key)
    }

    fn read_page(&self, query: &PageQuery) -> Result<Vec<Record>, SourceError> {
        (**self).read_page(query)
    }

    fn containers_by_id(&self, ids: &[ContainerId]) -> Result<Vec<Container>, SourceError> {
        (**self).containers_by_id(ids)
    }

    fn groups_by_id(&self, ids: &[GroupId]) -> Result<Vec<Group>, SourceError> {
        (**self).groups_by_id(ids)
    }
}
