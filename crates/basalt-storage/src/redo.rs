//! Redo-side log records and the per-transaction staging buffer.
//!
//! The transaction manager and the data table stage [`LogRecord`]s into a
//! [`RedoBuffer`]; `finalize(true)` hands the accumulated records to the
//! configured [`LogSink`] (the log manager), `finalize(false)` discards them
//! (abort). A `None` sink is the "logging disabled" configuration: commit
//! callbacks then run inline at commit time instead of after log
//! acceptance.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use basalt_error::Result;
use basalt_types::{Timestamp, TupleSlot};

use crate::table::DataTable;
use crate::undo::RecordBufferPool;
use crate::value::ProjectedDelta;

/// Invoked once the log has durably accepted the transaction's commit.
pub type CommitCallback = Box<dyn FnOnce() + Send + 'static>;

/// After-image of a single update or insert.
pub struct RedoRecord {
    table: Arc<DataTable>,
    slot: TupleSlot,
    delta: ProjectedDelta,
}

impl RedoRecord {
    #[must_use]
    pub fn new(table: Arc<DataTable>, slot: TupleSlot, delta: ProjectedDelta) -> Self {
        Self { table, slot, delta }
    }

    #[inline]
    #[must_use]
    pub fn table(&self) -> &Arc<DataTable> {
        &self.table
    }

    #[inline]
    #[must_use]
    pub fn slot(&self) -> TupleSlot {
        self.slot
    }

    #[inline]
    #[must_use]
    pub fn delta(&self) -> &ProjectedDelta {
        &self.delta
    }
}

impl std::fmt::Debug for RedoRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedoRecord")
            .field("table", &self.table.id())
            .field("slot", &self.slot)
            .field("columns", &self.delta.len())
            .finish_non_exhaustive()
    }
}

/// Marks a transaction's position in the log.
///
/// Carries the commit callback and the transaction's shared
/// `log_processed` flag; [`CommitRecord::mark_durable`] flips the flag and
/// runs the callback once the log manager has accepted the record.
pub struct CommitRecord {
    start_time: Timestamp,
    commit_time: Timestamp,
    is_read_only: bool,
    callback: CommitCallback,
    log_processed: Arc<AtomicBool>,
}

impl CommitRecord {
    #[must_use]
    pub fn new(
        start_time: Timestamp,
        commit_time: Timestamp,
        is_read_only: bool,
        callback: CommitCallback,
        log_processed: Arc<AtomicBool>,
    ) -> Self {
        Self {
            start_time,
            commit_time,
            is_read_only,
            callback,
            log_processed,
        }
    }

    #[inline]
    #[must_use]
    pub fn start_time(&self) -> Timestamp {
        self.start_time
    }

    #[inline]
    #[must_use]
    pub fn commit_time(&self) -> Timestamp {
        self.commit_time
    }

    #[inline]
    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.is_read_only
    }

    /// Flip the owning transaction's `log_processed` flag and invoke the
    /// commit callback. Consumes the record.
    pub fn mark_durable(self) {
        self.log_processed.store(true, Ordering::SeqCst);
        (self.callback)();
    }
}

impl std::fmt::Debug for CommitRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommitRecord")
            .field("start_time", &self.start_time)
            .field("commit_time", &self.commit_time)
            .field("is_read_only", &self.is_read_only)
            .finish_non_exhaustive()
    }
}

/// One entry in a transaction's redo buffer.
#[derive(Debug)]
pub enum LogRecord {
    Redo(RedoRecord),
    /// Logical delete of a slot.
    Delete {
        table: Arc<DataTable>,
        slot: TupleSlot,
    },
    Commit(CommitRecord),
}

impl LogRecord {
    #[inline]
    #[must_use]
    pub fn as_redo(&self) -> Option<&RedoRecord> {
        match self {
            Self::Redo(r) => Some(r),
            _ => None,
        }
    }

    #[inline]
    #[must_use]
    pub fn as_commit(&self) -> Option<&CommitRecord> {
        match self {
            Self::Commit(c) => Some(c),
            _ => None,
        }
    }
}

/// Downstream consumer of finalized redo buffers.
///
/// The log manager implements this; tests substitute recording sinks.
pub trait LogSink: Send + Sync {
    /// Take ownership of a transaction's finalized records.
    fn accept(&self, records: Vec<LogRecord>);
}

/// Per-transaction staging area for [`LogRecord`]s.
///
/// Records are accounted against the pool's segment budget while staged;
/// the budget is returned on finalize, whether the records are flushed to
/// the sink or discarded.
pub struct RedoBuffer {
    pool: Arc<RecordBufferPool>,
    sink: Option<Arc<dyn LogSink>>,
    records: Vec<LogRecord>,
    budgeted: usize,
    finalized: bool,
}

impl RedoBuffer {
    #[must_use]
    pub fn new(pool: Arc<RecordBufferPool>, sink: Option<Arc<dyn LogSink>>) -> Self {
        Self {
            pool,
            sink,
            records: Vec::new(),
            budgeted: 0,
            finalized: false,
        }
    }

    /// Whether a log sink is configured (logging enabled).
    #[inline]
    #[must_use]
    pub fn has_sink(&self) -> bool {
        self.sink.is_some()
    }

    pub fn push(&mut self, record: LogRecord) -> Result<()> {
        debug_assert!(!self.finalized, "staging into a finalized redo buffer");
        self.pool.reserve_segment()?;
        self.budgeted += 1;
        self.records.push(record);
        Ok(())
    }

    /// Stage a commit record. Commit cannot fail, so commit records do not
    /// draw from the segment budget.
    pub fn push_commit(&mut self, record: CommitRecord) {
        debug_assert!(!self.finalized, "staging into a finalized redo buffer");
        self.records.push(LogRecord::Commit(record));
    }

    #[inline]
    #[must_use]
    pub fn last(&self) -> Option<&LogRecord> {
        self.records.last()
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Finish the buffer. With `flush` and a sink configured the records go
    /// to the sink; otherwise they are discarded. Either way the segment
    /// budget is returned. Finalizing twice is a no-op.
    pub fn finalize(&mut self, flush: bool) {
        if self.finalized {
            return;
        }
        self.finalized = true;
        let records = std::mem::take(&mut self.records);
        for _ in 0..self.budgeted {
            self.pool.release_segment();
        }
        self.budgeted = 0;
        match (&self.sink, flush) {
            (Some(sink), true) => sink.accept(records),
            _ => drop(records),
        }
    }
}

impl std::fmt::Debug for RedoBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RedoBuffer")
            .field("records", &self.records.len())
            .field("finalized", &self.finalized)
            .field("has_sink", &self.sink.is_some())
            .finish_non_exhaustive()
    }
}
