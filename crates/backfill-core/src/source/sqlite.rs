//! SQLite-backed record source.

use std::path::Path;
use std::time::Duration;

use rusqlite::{Connection, OpenFlags, params, params_from_iter};
use tracing::debug;

use super::{PageQuery, RecordSource};
use crate::error::SourceError;
use crate::model::{Container, ContainerId, Group, GroupId, Record, RecordId, Window, WindowSnapshot};

/// Tables read by [`SqliteSource`].
///
/// There are deliberately no foreign keys: historical stores routinely carry
/// records whose container or group has since been deleted, and enrichment
/// has to see those dangling references rather than have them hidden.
pub const SCHEMA_SQL: &str = "
CREATE TABLE IF NOT EXISTS containers (
    id              INTEGER PRIMARY KEY,
    slug            TEXT NOT NULL,
    organization_id INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS record_groups (
    id           INTEGER PRIMARY KEY,
    container_id INTEGER NOT NULL,
    title        TEXT NOT NULL DEFAULT ''
);

CREATE TABLE IF NOT EXISTS records (
    id           INTEGER PRIMARY KEY,
    event_id     TEXT NOT NULL,
    container_id INTEGER NOT NULL,
    group_id     INTEGER,
    timestamp_ms INTEGER NOT NULL,
    payload      TEXT NOT NULL DEFAULT '{}'
);

CREATE INDEX IF NOT EXISTS idx_records_window ON records (timestamp_ms, id);
";

const ELIGIBLE: &str = "timestamp_ms >= ?1 AND timestamp_ms < ?2 AND group_id IS NOT NULL";

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Read-only record source over a SQLite database.
#[derive(Debug)]
pub struct SqliteSource {
    conn: Connection,
}

struct RawRecord {
    id: i64,
    event_id: String,
    container_id: i64,
    group_id: Option<i64>,
    timestamp_ms: i64,
    payload: String,
}

impl SqliteSource {
    /// Open an existing database read-only.
    pub fn open(path: &Path) -> Result<Self, SourceError> {
        let flags = OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX;
        let conn = Connection::open_with_flags(path, flags).map_err(|e| SourceError::Open {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        debug!(path = %path.display(), "Opened record store");
        Ok(Self { conn })
    }

    /// Wrap an already-open connection (tests, embedding callers).
    #[must_use]
    pub fn from_connection(conn: Connection) -> Self {
        Self { conn }
    }

    #[must_use]
    pub fn connection(&self) -> &Connection {
        &self.conn
    }

    fn decode(raw: RawRecord) -> Result<Record, SourceError> {
        let payload =
            serde_json::from_str(&raw.payload).map_err(|e| SourceError::Corrupt {
                record_id: raw.id,
                reason: format!("payload is not valid JSON: {e}"),
            })?;
        Ok(Record {
            id: raw.id,
            event_id: raw.event_id,
            container_id: raw.container_id,
            group_id: raw.group_id,
            timestamp_ms: raw.timestamp_ms,
            payload,
        })
    }
}

fn in_clause(len: usize) -> String {
    let mut placeholders = "?,".repeat(len);
    placeholders.pop();
    placeholders
}

impl RecordSource for SqliteSource {
    fn snapshot(&self, window: &Window) -> Result<WindowSnapshot, SourceError> {
        let sql = format!("SELECT COUNT(*), MAX(id) FROM records WHERE {ELIGIBLE}");
        let (count, max_key): (i64, Option<i64>) =
            self.conn
                .query_row(&sql, params![window.from_ms, window.to_ms], |row| {
                    Ok((row.get(0)?, row.get(1)?))
                })?;
        Ok(WindowSnapshot {
            count: count as u64,
            max_key,
        })
    }

    fn count_after(
        &self,
        window: &Window,
        after_key: RecordId,
        upto_key: RecordId,
    ) -> Result<u64, SourceError> {
        let sql = format!("SELECT COUNT(*) FROM records WHERE {ELIGIBLE} AND id > ?3 AND id <= ?4");
        let count: i64 = self.conn.query_row(
            &sql,
            params![window.from_ms, window.to_ms, after_key, upto_key],
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    fn read_page(&self, query: &PageQuery) -> Result<Vec<Record>, SourceError> {
        let sql = format!(
            "SELECT id, event_id, container_id, group_id, timestamp_ms, payload
             FROM records
             WHERE {ELIGIBLE} AND id > ?3 AND id <= ?4
             ORDER BY id
             LIMIT ?5"
        );
        let mut stmt = self.conn.prepare_cached(&sql)?;
        let rows = stmt.query_map(
            params![
                query.window.from_ms,
                query.window.to_ms,
                query.after_key.unwrap_or(i64::MIN),
                query.upto_key,
                query.limit as i64,
            ],
            |row| {
                Ok(RawRecord {
                    id: row.get(0)?,
                    event_id: row.get(1)?,
                    container_id: row.get(2)?,
                    group_id: row.get(3)?,
                    timestamp_ms: row.get(4)?,
                    payload: row.get(5)?,
                })
            },
        )?;

        let mut records = Vec::with_capacity(query.limit.min(1024));
        for raw in rows {
            records.push(Self::decode(raw?)?);
        }
        Ok(records)
    }

    fn containers_by_id(&self, ids: &[ContainerId]) -> Result<Vec<Container>, SourceError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT id, slug, organization_id FROM containers WHERE id IN ({})",
            in_clause(ids.len())
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(ids.iter()), |row| {
            Ok(Container {
                id: row.get(0)?,
                slug: row.get(1)?,
                organization_id: row.get(2)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }

    fn groups_by_id(&self, ids: &[GroupId]) -> Result<Vec<Group>, SourceError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let sql = format!(
            "SELECT id, container_id, title FROM record_groups WHERE id IN ({})",
            in_clause(ids.len())
        );
        let mut stmt = self.conn.prepare(&sql)?;
        let rows = stmt.query_map(params_from_iter(ids.iter()), |row| {
            Ok(Group {
                id: row.get(0)?,
                container_id: row.get(1)?,
                title: row.get(2)?,
            })
        })?;
        Ok(rows.collect::<Result<Vec<_>, _>>()?)
    }
}
