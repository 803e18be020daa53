//! The write-ahead log manager.
//!
//! Transactions finalize their redo buffers into the manager's queue (via
//! the [`LogSink`] seam); [`LogManager::flush`] drains the queue, writes
//! checksummed frames to the log file, syncs, and only then flips each
//! transaction's `log_processed` flag and runs its commit callback.
//!
//! Read-only commit records are queued like any other (speculative readers
//! of a recovered log need their visibility decided) but they are never
//! written to disk; their callbacks still run on flush.
//!
//! Frame format (all integers little-endian):
//!
//! ```text
//! file   := header frame*
//! header := magic[8] version:u16
//! frame  := len:u32 body            len = body length
//! body   := kind:u8 payload checksum:u64   checksum = xxh3(kind payload)
//! ```

use std::collections::VecDeque;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::path::Path;

use parking_lot::Mutex;
use xxhash_rust::xxh3::xxh3_64;

use basalt_error::{BasaltError, Result};
use basalt_storage::{ColumnValue, CommitRecord, LogRecord, LogSink, RedoRecord};
use basalt_types::encoding::{
    append_i64_le, append_u16_le, append_u32_le, append_u64_le, read_u16_le, read_u32_le,
    read_u64_le,
};
use basalt_types::TupleSlot;

/// First eight bytes of every log file.
pub const LOG_MAGIC: [u8; 8] = *b"BSLTLOG\0";

/// Current on-disk format version.
pub const LOG_VERSION: u16 = 1;

const FRAME_REDO: u8 = 1;
const FRAME_DELETE: u8 = 2;
const FRAME_COMMIT: u8 = 3;

const TAG_NULL: u8 = 0;
const TAG_FIXED: u8 = 1;
const TAG_VARLEN: u8 = 2;

/// Counters returned by one [`LogManager::flush`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FlushSummary {
    /// Finalized buffers drained from the queue.
    pub buffers: usize,
    /// Frames written to the file (read-only commits excluded).
    pub frames: usize,
    /// Commit callbacks invoked.
    pub commits: usize,
}

struct LogFile {
    file: File,
    bytes_written: u64,
}

/// Durably orders commit records and drives their callbacks.
pub struct LogManager {
    queue: Mutex<VecDeque<Vec<LogRecord>>>,
    out: Mutex<LogFile>,
}

impl LogManager {
    /// Create a fresh log file at `path` and write its header.
    pub fn create(path: &Path) -> Result<Self> {
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(path)?;
        let mut header = Vec::with_capacity(10);
        header.extend_from_slice(&LOG_MAGIC);
        append_u16_le(&mut header, LOG_VERSION);
        file.write_all(&header)?;
        file.sync_data()?;
        Ok(Self {
            queue: Mutex::new(VecDeque::new()),
            out: Mutex::new(LogFile {
                file,
                bytes_written: header.len() as u64,
            }),
        })
    }

    /// Number of finalized buffers waiting to be flushed.
    #[must_use]
    pub fn queued_buffers(&self) -> usize {
        self.queue.lock().len()
    }

    /// Drain the queue, persist every loggable frame, sync, then run the
    /// commit callbacks of everything drained.
    pub fn flush(&self) -> Result<FlushSummary> {
        let drained: Vec<Vec<LogRecord>> = {
            let mut queue = self.queue.lock();
            queue.drain(..).collect()
        };

        let mut summary = FlushSummary {
            buffers: drained.len(),
            ..FlushSummary::default()
        };
        let mut bytes = Vec::new();
        let mut commits: Vec<CommitRecord> = Vec::new();

        for records in drained {
            for record in records {
                match record {
                    LogRecord::Redo(redo) => {
                        append_frame(&mut bytes, FRAME_REDO, &encode_redo(&redo));
                        summary.frames += 1;
                    }
                    LogRecord::Delete { table, slot } => {
                        append_frame(&mut bytes, FRAME_DELETE, &encode_delete(table.id(), slot));
                        summary.frames += 1;
                    }
                    LogRecord::Commit(commit) => {
                        if !commit.is_read_only() {
                            append_frame(&mut bytes, FRAME_COMMIT, &encode_commit(&commit));
                            summary.frames += 1;
                        }
                        commits.push(commit);
                    }
                }
            }
        }

        if !bytes.is_empty() {
            let mut out = self.out.lock();
            out.file.write_all(&bytes)?;
            out.file.sync_data()?;
            out.bytes_written += bytes.len() as u64;
        }

        summary.commits = commits.len();
        for commit in commits {
            commit.mark_durable();
        }

        tracing::debug!(
            buffers = summary.buffers,
            frames = summary.frames,
            commits = summary.commits,
            "log flush"
        );
        Ok(summary)
    }

    /// Bytes written to the file so far, header included.
    #[must_use]
    pub fn bytes_written(&self) -> u64 {
        self.out.lock().bytes_written
    }
}

impl LogSink for LogManager {
    fn accept(&self, records: Vec<LogRecord>) {
        self.queue.lock().push_back(records);
    }
}

impl std::fmt::Debug for LogManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LogManager")
            .field("queued_buffers", &self.queued_buffers())
            .field("bytes_written", &self.bytes_written())
            .finish_non_exhaustive()
    }
}

fn append_frame(out: &mut Vec<u8>, kind: u8, payload: &[u8]) {
    let mut body = Vec::with_capacity(1 + payload.len() + 8);
    body.push(kind);
    body.extend_from_slice(payload);
    let checksum = xxh3_64(&body);
    append_u64_le(&mut body, checksum);
    append_u32_le(out, body.len() as u32);
    out.extend_from_slice(&body);
}

fn encode_redo(redo: &RedoRecord) -> Vec<u8> {
    let mut payload = Vec::new();
    append_u32_le(&mut payload, redo.table().id().get());
    append_u32_le(&mut payload, redo.slot().get());
    append_u16_le(&mut payload, redo.delta().len() as u16);
    for (column, cell) in redo.delta().iter() {
        append_u16_le(&mut payload, column.get());
        match cell {
            None => payload.push(TAG_NULL),
            Some(ColumnValue::Fixed(v)) => {
                payload.push(TAG_FIXED);
                append_u64_le(&mut payload, *v);
            }
            Some(ColumnValue::Varlen(v)) => {
                payload.push(TAG_VARLEN);
                append_u32_le(&mut payload, v.len() as u32);
                payload.extend_from_slice(v.as_bytes());
            }
        }
    }
    payload
}

fn encode_delete(table: basalt_types::TableId, slot: TupleSlot) -> Vec<u8> {
    let mut payload = Vec::new();
    append_u32_le(&mut payload, table.get());
    append_u32_le(&mut payload, slot.get());
    payload
}

fn encode_commit(commit: &CommitRecord) -> Vec<u8> {
    let mut payload = Vec::new();
    append_i64_le(&mut payload, commit.start_time().get());
    append_i64_le(&mut payload, commit.commit_time().get());
    payload.push(u8::from(commit.is_read_only()));
    payload
}

/// Structurally verify a log file: header, frame lengths, checksums.
/// Returns the number of frames. Recovery replay is a different component;
/// this is the integrity check it would run first.
pub fn verify_log(path: &Path) -> Result<usize> {
    let mut bytes = Vec::new();
    File::open(path)?.read_to_end(&mut bytes)?;

    let corrupt = |offset: u64, detail: &str| BasaltError::LogCorrupt {
        offset,
        detail: detail.to_owned(),
    };

    if bytes.len() < LOG_MAGIC.len() + 2 || bytes[..LOG_MAGIC.len()] != LOG_MAGIC {
        return Err(corrupt(0, "bad magic"));
    }
    let (version, mut rest) = read_u16_le(&bytes[LOG_MAGIC.len()..]).expect("header length checked");
    if version != LOG_VERSION {
        return Err(corrupt(LOG_MAGIC.len() as u64, "unsupported version"));
    }

    let mut frames = 0_usize;
    let mut offset = (LOG_MAGIC.len() + 2) as u64;
    while !rest.is_empty() {
        let Some((len, body_and_rest)) = read_u32_le(rest) else {
            return Err(corrupt(offset, "truncated frame length"));
        };
        let len = len as usize;
        if body_and_rest.len() < len || len < 9 {
            return Err(corrupt(offset, "truncated frame body"));
        }
        let (body, tail) = body_and_rest.split_at(len);
        let (content, stored) = body.split_at(len - 8);
        let (checksum, _) = read_u64_le(stored).expect("checksum length checked");
        if xxh3_64(content) != checksum {
            return Err(corrupt(offset, "checksum mismatch"));
        }
        frames += 1;
        offset += 4 + len as u64;
        rest = tail;
    }
    Ok(frames)
}
