//! Records, the entities they reference, and the traversal window.
//!
//! Records are read-only for the whole run. Enrichment never mutates a
//! [`Record`]; it wraps it in an [`EnrichedRecord`] that shares the resolved
//! [`Container`] and [`Group`] with every other record of the same page.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Retention used when the configured value is unset, zero or negative.
pub const DEFAULT_RETENTION_DAYS: u32 = 90;

/// Default number of records per page.
pub const DEFAULT_PAGE_SIZE: usize = 100;

pub const MS_PER_DAY: i64 = 86_400_000;

pub type RecordId = i64;
pub type ContainerId = i64;
pub type GroupId = i64;

/// An immutable historical event.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Record {
    /// Primary key; stable traversal order.
    pub id: RecordId,
    /// External event identifier.
    pub event_id: String,
    pub container_id: ContainerId,
    /// Records without a group are never eligible for backfill.
    pub group_id: Option<GroupId>,
    /// Epoch milliseconds.
    pub timestamp_ms: i64,
    /// Opaque event body.
    pub payload: serde_json::Value,
}

/// The owner of a set of records (a project).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Container {
    pub id: ContainerId,
    pub slug: String,
    pub organization_id: i64,
}

/// The aggregation target a record belongs to (an issue).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub id: GroupId,
    pub container_id: ContainerId,
    pub title: String,
}

/// A record with its container and group resolved.
#[derive(Debug, Clone)]
pub struct EnrichedRecord {
    pub record: Record,
    pub container: Arc<Container>,
    pub group: Arc<Group>,
}

/// Resolve the effective retention from the operator option.
///
/// Unset, zero and negative values all fall back to [`DEFAULT_RETENTION_DAYS`].
#[must_use]
pub fn effective_retention_days(configured: Option<i64>) -> u32 {
    match configured {
        Some(days) if days > 0 => u32::try_from(days).unwrap_or(u32::MAX),
        _ => DEFAULT_RETENTION_DAYS,
    }
}

/// Half-open timestamp range `[from_ms, to_ms)` in epoch milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Window {
    pub from_ms: i64,
    pub to_ms: i64,
}

impl Window {
    /// Window covering the last `retention_days` days up to `now_ms`.
    #[must_use]
    pub fn from_retention(now_ms: i64, retention_days: u32) -> Self {
        let span = i64::from(retention_days).saturating_mul(MS_PER_DAY);
        Self {
            from_ms: now_ms.saturating_sub(span),
            to_ms: now_ms,
        }
    }

    #[must_use]
    pub fn contains(&self, timestamp_ms: i64) -> bool {
        timestamp_ms >= self.from_ms && timestamp_ms < self.to_ms
    }

    #[must_use]
    pub fn is_valid(&self) -> bool {
        self.from_ms <= self.to_ms
    }
}

impl fmt::Display for Window {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let render = |ms: i64| {
            DateTime::<Utc>::from_timestamp_millis(ms)
                .map_or_else(|| ms.to_string(), |dt| dt.to_rfc3339())
        };
        write!(f, "[{}, {})", render(self.from_ms), render(self.to_ms))
    }
}

/// Matching-set summary taken once before traversal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WindowSnapshot {
    /// Number of eligible records in the window.
    pub count: u64,
    /// Highest eligible primary key; traversal never goes past it.
    pub max_key: Option<RecordId>,
}

/// One ordered, bounded slice of the matching set.
#[derive(Debug, Clone, PartialEq)]
pub struct Page {
    /// Zero-based page number within the run.
    pub index: u64,
    pub records: Vec<Record>,
}

impl Page {
    #[must_use]
    pub fn last_key(&self) -> Option<RecordId> {
        self.records.last().map(|r| r.id)
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}
