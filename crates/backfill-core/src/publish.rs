//! Downstream event stream boundary.
//!
//! Backfilled records enter the stream through [`EventStreamInsert::backfill`],
//! which pins every live-only flag off and asks the consumer not to run its
//! post-processing. Two sinks ship with the crate:
//!
//! - [`AppendLogPublisher`]: length-prefixed frames, `[u32 LE len][JSON]`
//! - [`JsonLinesPublisher`]: one JSON document per line on any writer
//!
//! [`StreamLogReader`] reads append-log frames back.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::error::PublishError;
use crate::fingerprint::Fingerprint;
use crate::model::{Container, EnrichedRecord, Group, Record, RecordId};

/// One message on the downstream event stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventStreamInsert {
    pub group: Group,
    pub record: Record,
    pub container: Container,
    pub is_new: bool,
    pub is_regression: bool,
    pub is_new_group_environment: bool,
    pub primary_hash: Fingerprint,
    pub skip_consume: bool,
}

impl EventStreamInsert {
    /// Build the insert for a replayed record.
    #[must_use]
    pub fn backfill(enriched: &EnrichedRecord, primary_hash: Fingerprint) -> Self {
        Self {
            group: Group::clone(&enriched.group),
            record: enriched.record.clone(),
            container: Container::clone(&enriched.container),
            is_new: false,
            is_regression: false,
            is_new_group_environment: false,
            primary_hash,
            skip_consume: true,
        }
    }

    #[must_use]
    pub fn record_id(&self) -> RecordId {
        self.record.id
    }
}

/// Synchronous sink for event stream inserts.
///
/// `publish` returns only once the insert has been handed to the stream.
/// Implementations do not retry.
pub trait StreamPublisher {
    fn publish(&mut self, insert: &EventStreamInsert) -> Result<(), PublishError>;

    /// Push buffered inserts through. Called at every page boundary.
    fn flush(&mut self) -> Result<(), PublishError>;
}

impl<P: StreamPublisher + ?Sized> StreamPublisher for &mut P {
    fn publish(&mut self, insert: &EventStreamInsert) -> Result<(), PublishError> {
        (**self).publish(insert)
    }

    fn flush(&mut self) -> Result<(), PublishError> {
        (**self).flush()
    }
}

impl<P: StreamPublisher + ?Sized> StreamPublisher for Box<P> {
    fn publish(&mut self, insert: &EventStreamInsert) -> Result<(), PublishError> {
        (**self).publish(insert)
    }

    fn flush(&mut self) -> Result<(), PublishError> {
        (**self).flush()
    }
}

// ---------------------------------------------------------------------------
// Append log
// ---------------------------------------------------------------------------

/// Appends inserts to a file as `[u32 LE payload_len][JSON payload]` frames.
///
/// Each frame reaches the file before `publish` returns; `flush` only adds
/// the optional fsync. A failed write is rolled back to the last whole frame.
pub struct AppendLogPublisher {
    path: PathBuf,
    file: File,
    fsync: bool,
    frames_written: u64,
    committed_len: u64,
}

impl AppendLogPublisher {
    /// Open (or create) the log for appending.
    pub fn open(path: &Path, fsync: bool) -> Result<Self, PublishError> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        let committed_len = file.metadata()?.len();
        debug!(path = %path.display(), fsync, committed_len, "Opened append-log sink");
        Ok(Self {
            path: path.to_path_buf(),
            file,
            fsync,
            frames_written: 0,
            committed_len,
        })
    }

    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Frames appended by this publisher (not counting pre-existing ones).
    #[must_use]
    pub fn frames_written(&self) -> u64 {
        self.frames_written
    }

    /// Byte length of the log up to the last whole frame.
    #[must_use]
    pub fn committed_len(&self) -> u64 {
        self.committed_len
    }
}

impl StreamPublisher for AppendLogPublisher {
    fn publish(&mut self, insert: &EventStreamInsert) -> Result<(), PublishError> {
        let payload = serde_json::to_vec(insert)?;
        let len = u32::try_from(payload.len())
            .map_err(|_| PublishError::FrameTooLarge { len: payload.len() })?;

        let mut frame = Vec::with_capacity(4 + payload.len());
        frame.extend_from_slice(&len.to_le_bytes());
        frame.extend_from_slice(&payload);

        if let Err(err) = self.file.write_all(&frame) {
            if let Err(truncate_err) = self.file.set_len(self.committed_len) {
                warn!(
                    path = %self.path.display(),
                    committed_len = self.committed_len,
                    error = %truncate_err,
                    "Could not drop partial frame"
                );
            }
            return Err(err.into());
        }
        self.committed_len += frame.len() as u64;
        self.frames_written += 1;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), PublishError> {
        if self.fsync {
            self.file.sync_data()?;
        }
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// JSON lines
// ---------------------------------------------------------------------------

/// Writes one JSON document per insert, newline-terminated.
pub struct JsonLinesPublisher<W: Write> {
    writer: W,
}

impl<W: Write> JsonLinesPublisher<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    pub fn into_inner(self) -> W {
        self.writer
    }
}

impl<W: Write> StreamPublisher for JsonLinesPublisher<W> {
    fn publish(&mut self, insert: &EventStreamInsert) -> Result<(), PublishError> {
        serde_json::to_writer(&mut self.writer, insert)?;
        self.writer.write_all(b"\n")?;
        Ok(())
    }

    fn flush(&mut self) -> Result<(), PublishError> {
        self.writer.flush()?;
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Reader
// ---------------------------------------------------------------------------

/// Error reading an append log back.
#[derive(Debug, Error)]
pub enum LogReadError {
    #[error("log read I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error at byte {byte_offset}: {source}")]
    Deserialize {
        byte_offset: u64,
        source: serde_json::Error,
    },
}

/// A decoded frame and where it started.
#[derive(Debug, Clone)]
pub struct LogFrame {
    pub insert: EventStreamInsert,
    pub byte_offset: u64,
    pub ordinal: u64,
}

/// Sequential reader over an append log.
///
/// A frame whose declared length runs past the end of the file is a torn
/// tail and reads as end of log.
pub struct StreamLogReader {
    file: File,
    byte_offset: u64,
    next_ordinal: u64,
}

impl StreamLogReader {
    pub fn open(path: &Path) -> Result<Self, LogReadError> {
        let mut file = File::open(path)?;
        file.seek(SeekFrom::Start(0))?;
        Ok(Self {
            file,
            byte_offset: 0,
            next_ordinal: 0,
        })
    }

    /// Read the next frame, returning `None` at end of log.
    pub fn next_frame(&mut self) -> Result<Option<LogFrame>, LogReadError> {
        let file_len = self.file.metadata()?.len();
        if self.byte_offset + 4 > file_len {
            return Ok(None);
        }

        let start = self.byte_offset;
        let mut len_buf = [0u8; 4];
        self.file.read_exact(&mut len_buf)?;
        let payload_len = u64::from(u32::from_le_bytes(len_buf));

        if start + 4 + payload_len > file_len {
            self.file.seek(SeekFrom::Start(start))?;
            return Ok(None);
        }

        let mut payload = vec![0u8; payload_len as usize];
        self.file.read_exact(&mut payload)?;
        let insert = serde_json::from_slice(&payload).map_err(|source| LogReadError::Deserialize {
            byte_offset: start,
            source,
        })?;

        let frame = LogFrame {
            insert,
            byte_offset: start,
            ordinal: self.next_ordinal,
        };
        self.byte_offset = start + 4 + payload_len;
        self.next_ordinal += 1;
        Ok(Some(frame))
    }

    /// Current byte offset in the file.
    #[must_use]
    pub fn byte_offset(&self) -> u64 {
        self.byte_offset
    }
}

impl Iterator for StreamLogReader {
    type Item = Result<LogFrame, LogReadError>;

    fn next(&mut self) -> Option<Self::Item> {
        self.next_frame().transpose()
    }
}

/// Summary of an append log, as printed by `backfill inspect`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LogSummary {
    pub frames: u64,
    pub first_record_id: Option<RecordId>,
    pub last_record_id: Option<RecordId>,
    pub bytes: u64,
}

/// Scan a whole append log.
pub fn summarize_log(path: &Path) -> Result<LogSummary, LogReadError> {
    let mut reader = StreamLogReader::open(path)?;
    let mut summary = LogSummary::default();
    while let Some(frame) = reader.next_frame()? {
        let id = frame.insert.record_id();
        summary.first_record_id.get_or_insert(id);
        summary.last_record_id = Some(id);
        summary.frames += 1;
    }
    summary.bytes = reader.byte_offset();
    Ok(summary)
}
