//! Transaction and worker contexts.
//!
//! A [`TransactionContext`] is created by `begin`, exclusively driven by its
//! caller until `commit` or `abort` returns, and then (when GC is enabled)
//! handed to the collector through the completed queue. Its buffers are
//! behind transaction-local latches only because the storage layer reaches
//! them through a shared reference; there is no cross-thread contention on
//! them by construction.

use std::collections::{HashSet, VecDeque};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use basalt_error::Result;
use basalt_storage::{
    LogRecord, LogSink, RecordBufferPool, RedoBuffer, TransactionHandle, UndoIdx, UndoRecord,
    VarlenEntry,
};
use basalt_types::{AtomicTimestamp, Timestamp, WorkerId};

/// Completed transactions awaiting the GC, newest first.
pub type TransactionQueue = VecDeque<Arc<TransactionContext>>;

// ---------------------------------------------------------------------------
// UndoBuffer
// ---------------------------------------------------------------------------

/// Ordered list of a transaction's undo records, in install order.
///
/// The records themselves live in the pool's shared arena (readers traverse
/// them through version chains); the buffer holds their indices.
pub struct UndoBuffer {
    pool: Arc<RecordBufferPool>,
    records: Vec<UndoIdx>,
}

impl UndoBuffer {
    fn new(pool: Arc<RecordBufferPool>) -> Self {
        Self {
            pool,
            records: Vec::new(),
        }
    }

    fn push(&mut self, record: UndoRecord) -> Result<UndoIdx> {
        let idx = self.pool.alloc_undo(record)?;
        self.records.push(idx);
        Ok(idx)
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[inline]
    #[must_use]
    pub fn last(&self) -> Option<UndoIdx> {
        self.records.last().copied()
    }

    #[inline]
    #[must_use]
    pub fn records(&self) -> &[UndoIdx] {
        &self.records
    }
}

impl std::fmt::Debug for UndoBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UndoBuffer")
            .field("records", &self.records.len())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// TransactionContext
// ---------------------------------------------------------------------------

/// State of one running (or completed, pre-GC) transaction.
pub struct TransactionContext {
    start_time: Timestamp,
    /// The biased in-progress id until commit stores the commit timestamp.
    pub(crate) txn_id: AtomicTimestamp,
    pub(crate) undo_buffer: Mutex<UndoBuffer>,
    pub(crate) redo_buffer: Mutex<RedoBuffer>,
    /// Varlen payload handles orphaned by rollback or a lost-race update;
    /// the GC frees them after handoff.
    loose_entries: Mutex<Vec<VarlenEntry>>,
    worker: Option<Arc<WorkerContext>>,
    pub(crate) log_processed: Arc<AtomicBool>,
}

impl TransactionContext {
    pub(crate) fn new(
        start_time: Timestamp,
        pool: Arc<RecordBufferPool>,
        sink: Option<Arc<dyn LogSink>>,
        worker: Option<Arc<WorkerContext>>,
    ) -> Self {
        Self {
            start_time,
            txn_id: AtomicTimestamp::new(start_time.to_txn_id()),
            undo_buffer: Mutex::new(UndoBuffer::new(Arc::clone(&pool))),
            redo_buffer: Mutex::new(RedoBuffer::new(pool, sink)),
            loose_entries: Mutex::new(Vec::new()),
            worker,
            log_processed: Arc::new(AtomicBool::new(false)),
        }
    }

    #[inline]
    #[must_use]
    pub fn start_time(&self) -> Timestamp {
        self.start_time
    }

    /// The current transaction id: biased while in progress, the commit
    /// timestamp once committed.
    #[inline]
    #[must_use]
    pub fn txn_id(&self) -> Timestamp {
        self.txn_id.load()
    }

    /// A transaction with no undo records has published nothing and commits
    /// through the read-only fast path.
    #[must_use]
    pub fn is_read_only(&self) -> bool {
        self.undo_buffer.lock().is_empty()
    }

    #[inline]
    #[must_use]
    pub fn worker(&self) -> Option<&Arc<WorkerContext>> {
        self.worker.as_ref()
    }

    /// Whether the log has accepted this transaction's commit (or the
    /// transaction aborted / committed with logging disabled).
    #[must_use]
    pub fn is_log_processed(&self) -> bool {
        self.log_processed.load(Ordering::SeqCst)
    }

    pub(crate) fn log_processed_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.log_processed)
    }

    pub(crate) fn record_loose(&self, entry: VarlenEntry) {
        self.loose_entries.lock().push(entry);
    }

    /// Snapshot of the loose payload handles (test and GC introspection).
    #[must_use]
    pub fn loose_entries(&self) -> Vec<VarlenEntry> {
        self.loose_entries.lock().clone()
    }

    /// Transfer the loose payload handles out, for the GC to drop once the
    /// transaction is unreachable.
    #[must_use]
    pub fn take_loose_entries(&self) -> Vec<VarlenEntry> {
        std::mem::take(&mut self.loose_entries.lock())
    }

    /// The transaction's undo record indices in install order, for the GC
    /// to unlink and free once below the watermark.
    #[must_use]
    pub fn undo_record_indices(&self) -> Vec<UndoIdx> {
        self.undo_buffer.lock().records().to_vec()
    }
}

impl TransactionHandle for TransactionContext {
    fn start_time(&self) -> Timestamp {
        self.start_time
    }

    fn txn_id(&self) -> Timestamp {
        self.txn_id.load()
    }

    fn stage_undo(&self, record: UndoRecord) -> Result<UndoIdx> {
        self.undo_buffer.lock().push(record)
    }

    fn stage_redo(&self, record: LogRecord) -> Result<()> {
        self.redo_buffer.lock().push(record)
    }
}

impl std::fmt::Debug for TransactionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionContext")
            .field("start_time", &self.start_time)
            .field("txn_id", &self.txn_id.load())
            .field("log_processed", &self.is_log_processed())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// WorkerContext
// ---------------------------------------------------------------------------

/// Per-thread shard of the running-transaction registry.
///
/// Threads that register get their begin/commit/abort bookkeeping on a
/// latch they mostly own; only the oldest-alive scan takes it shared from
/// outside.
pub struct WorkerContext {
    worker_id: WorkerId,
    running: RwLock<HashSet<Timestamp>>,
}

impl WorkerContext {
    pub(crate) fn new(worker_id: WorkerId) -> Self {
        Self {
            worker_id,
            running: RwLock::new(HashSet::new()),
        }
    }

    #[inline]
    #[must_use]
    pub fn worker_id(&self) -> WorkerId {
        self.worker_id
    }

    /// Number of this worker's currently live transactions.
    #[must_use]
    pub fn live_count(&self) -> usize {
        self.running.read().len()
    }

    pub(crate) fn insert_running(&self, start_time: Timestamp) -> bool {
        self.running.write().insert(start_time)
    }

    pub(crate) fn remove_running(&self, start_time: Timestamp) -> bool {
        self.running.write().remove(&start_time)
    }

    /// Minimum live start time, read under the shared latch.
    pub(crate) fn min_running(&self) -> Option<Timestamp> {
        self.running.read().iter().min().copied()
    }
}

impl std::fmt::Debug for WorkerContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerContext")
            .field("worker_id", &self.worker_id)
            .field("live", &self.live_count())
            .finish_non_exhaustive()
    }
}
