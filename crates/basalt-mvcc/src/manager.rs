//! The transaction manager: timestamp allocation, the running-transaction
//! registries, commit ordering against the log, and undo-driven rollback.
//!
//! Three concerns meet here and must hold simultaneously:
//!
//! 1. Commit records of updating transactions enter the log in
//!    commit-timestamp order: the exclusive section of the commit gate
//!    covers both the timestamp pull and the record emission.
//! 2. The GC watermark never passes a live transaction: `begin` holds the
//!    gate shared across timestamp allocation *and* registration, so an
//!    updating commit cannot complete (and feed the GC) while a newcomer
//!    exists but is not yet registered.
//! 3. Abort unwinds the undo buffer without deadlock: rollback takes no
//!    latch besides the per-slot ones, and never holds the arena lock
//!    across a slot access.

use std::collections::HashSet;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use basalt_error::Result;
use basalt_storage::{
    ColumnValue, CommitCallback, CommitRecord, LogRecord, LogSink, RecordBufferPool, UndoIdx,
    UndoRecordKind,
};
use basalt_types::{AtomicTimestamp, Timestamp, WorkerId};

use crate::context::{TransactionContext, TransactionQueue, WorkerContext};

/// Global fallback registry plus the GC handoff queue, guarded by one
/// latch: completions push here on the same acquisition that drops the
/// start time, keeping the hot commit path to a single extra lock.
#[derive(Default)]
struct GlobalTxnTable {
    running: HashSet<Timestamp>,
    completed: TransactionQueue,
}

/// Creates, commits, and aborts transactions, and maintains the global
/// state about all of them that the GC consumes.
pub struct TransactionManager {
    buffer_pool: Arc<RecordBufferPool>,
    /// The timestamp oracle. One counter serves start and commit
    /// timestamps, so their total order reflects issue order.
    time: AtomicTimestamp,
    /// Shared by `begin`, exclusive by updating commits. Read-only commits
    /// never touch it.
    commit_latch: RwLock<()>,
    global: Mutex<GlobalTxnTable>,
    workers: Mutex<Vec<Arc<WorkerContext>>>,
    gc_enabled: bool,
    log_manager: Option<Arc<dyn LogSink>>,
}

impl TransactionManager {
    /// `log_manager: None` disables logging: commit callbacks then run
    /// inline at commit time.
    #[must_use]
    pub fn new(
        buffer_pool: Arc<RecordBufferPool>,
        gc_enabled: bool,
        log_manager: Option<Arc<dyn LogSink>>,
    ) -> Self {
        Self {
            buffer_pool,
            time: AtomicTimestamp::new(Timestamp::ZERO),
            commit_latch: RwLock::new(()),
            global: Mutex::new(GlobalTxnTable::default()),
            workers: Mutex::new(Vec::new()),
            gc_enabled,
            log_manager,
        }
    }

    #[inline]
    #[must_use]
    pub fn buffer_pool(&self) -> &Arc<RecordBufferPool> {
        &self.buffer_pool
    }

    /// A unique timestamp; advances the oracle one tick.
    #[must_use]
    pub fn get_timestamp(&self) -> Timestamp {
        self.time.fetch_tick()
    }

    #[inline]
    #[must_use]
    pub fn gc_enabled(&self) -> bool {
        self.gc_enabled
    }

    /// Register a worker thread so its transactions are tracked on a
    /// per-thread shard instead of the global table.
    #[must_use]
    pub fn register_worker(&self, worker_id: WorkerId) -> Arc<WorkerContext> {
        let context = Arc::new(WorkerContext::new(worker_id));
        self.workers.lock().push(Arc::clone(&context));
        context
    }

    /// Remove a worker's shard. The caller must have finished every
    /// transaction begun on it.
    pub fn unregister_worker(&self, context: &Arc<WorkerContext>) {
        debug_assert_eq!(context.live_count(), 0, "unregistering a worker with live transactions");
        self.workers.lock().retain(|w| !Arc::ptr_eq(w, context));
    }

    /// Begin a transaction, registered on `worker`'s shard when one is
    /// supplied.
    pub fn begin(&self, worker: Option<&Arc<WorkerContext>>) -> Arc<TransactionContext> {
        // The gate also covers registration: otherwise an updating commit
        // could advance the clock, log out, and reach the GC while this
        // transaction exists unregistered, and the GC would reclaim
        // versions it is about to need.
        let _gate = self.commit_latch.read();
        let start_time = self.time.fetch_tick();
        let txn = Arc::new(TransactionContext::new(
            start_time,
            Arc::clone(&self.buffer_pool),
            self.log_manager.clone(),
            worker.map(Arc::clone),
        ));
        match worker {
            None => {
                let inserted = self.global.lock().running.insert(start_time);
                debug_assert!(inserted, "start time not globally unique");
            }
            Some(context) => {
                let inserted = context.insert_running(start_time);
                debug_assert!(inserted, "start time not globally unique");
            }
        }
        tracing::debug!(start = %start_time, "begin transaction");
        txn
    }

    /// Commit `txn`, making its writes visible. Returns the commit
    /// timestamp. `callback` runs once the log has durably accepted the
    /// commit (inline when logging is disabled).
    pub fn commit(&self, txn: &Arc<TransactionContext>, callback: CommitCallback) -> Timestamp {
        let commit_time = if txn.is_read_only() {
            self.read_only_commit(txn, callback)
        } else {
            self.updating_commit(txn, callback)
        };
        tracing::debug!(start = %txn.start_time(), commit = %commit_time, "commit transaction");
        self.deregister(txn);
        commit_time
    }

    /// Abort `txn`, rolling back its changes (if any). No timestamp is
    /// allocated and no commit gate is taken: every operation here is
    /// transaction-local.
    pub fn abort(&self, txn: &Arc<TransactionContext>) {
        let records = txn.undo_record_indices();
        for idx in records {
            let rolled = self.rollback(txn, idx);
            debug_assert!(rolled.is_ok(), "undo delta named a column outside its table's layout");
        }
        // The last update may have lost its write-write race and never been
        // installed; Rollback skipped it, but its staged after-image can
        // still own varlen payloads.
        self.gc_last_update_on_abort(txn);
        txn.redo_buffer.lock().finalize(false);
        txn.log_processed
            .store(true, std::sync::atomic::Ordering::SeqCst);
        tracing::debug!(start = %txn.start_time(), "abort transaction");
        self.deregister(txn);
    }

    /// A timestamp older than (or equal to) every transaction alive at the
    /// moment this call began observing the registries. Consumers treat it
    /// as a conservative watermark: transactions beginning mid-scan carry
    /// strictly larger start times.
    #[must_use]
    pub fn oldest_transaction_start_time(&self) -> Timestamp {
        // The next unissued timestamp bounds everything currently live.
        let mut oldest = self.time.load();
        {
            let workers = self.workers.lock();
            for context in workers.iter() {
                if let Some(min) = context.min_running() {
                    oldest = oldest.min(min);
                }
            }
        }
        // Worker-set latch dropped before the global latch: a worker that
        // unregisters between the two phases cannot contribute its last
        // live transaction, which the conservative contract tolerates.
        let global = self.global.lock();
        if let Some(min) = global.running.iter().min().copied() {
            oldest = oldest.min(min);
        }
        oldest
    }

    /// Swap out and return the completed-transactions queue. Ownership of
    /// every entry passes to the caller (the GC).
    #[must_use]
    pub fn completed_transactions_for_gc(&self) -> TransactionQueue {
        let mut global = self.global.lock();
        let queue = std::mem::take(&mut global.completed);
        drop(global);
        tracing::trace!(drained = queue.len(), "gc drained completed transactions");
        queue
    }

    // -----------------------------------------------------------------------
    // Commit internals
    // -----------------------------------------------------------------------

    /// Store the commit timestamp, emit the commit record (or fake its
    /// durability when logging is disabled), and hand the redo buffer on.
    fn log_commit(
        &self,
        txn: &TransactionContext,
        commit_time: Timestamp,
        callback: CommitCallback,
        is_read_only: bool,
    ) {
        txn.txn_id.store(commit_time);
        let mut redo = txn.redo_buffer.lock();
        if redo.has_sink() {
            // The commit has already happened for the rest of the system;
            // the record is what recovery and speculative readers order by.
            redo.push_commit(CommitRecord::new(
                txn.start_time(),
                commit_time,
                is_read_only,
                callback,
                txn.log_processed_flag(),
            ));
        } else {
            txn.log_processed
                .store(true, std::sync::atomic::Ordering::SeqCst);
            callback();
        }
        redo.finalize(true);
    }

    /// No installed versions, so no commit can ever depend on this one:
    /// everything happens outside the critical section.
    fn read_only_commit(&self, txn: &TransactionContext, callback: CommitCallback) -> Timestamp {
        let commit_time = self.time.fetch_tick();
        self.log_commit(txn, commit_time, callback, true);
        commit_time
    }

    fn updating_commit(&self, txn: &TransactionContext, callback: CommitCallback) -> Timestamp {
        let _gate = self.commit_latch.write();
        let commit_time = self.time.fetch_tick();
        // The record must reach the log inside the exclusive section, or a
        // later-stamped commit could enqueue first and a crash between the
        // two would lose this one from recovery.
        self.log_commit(txn, commit_time, callback, false);
        // Flip every undo stamp to committed.
        let undo = txn.undo_buffer.lock();
        for idx in undo.records() {
            let stamped = self
                .buffer_pool
                .with_undo(*idx, |rec| rec.timestamp().store(commit_time));
            debug_assert!(stamped.is_some(), "undo record reclaimed before commit");
        }
        commit_time
    }

    /// Drop `txn` from its registry and, when GC is on, push it onto the
    /// completed queue.
    fn deregister(&self, txn: &Arc<TransactionContext>) {
        let start_time = txn.start_time();
        match txn.worker() {
            None => {
                let mut global = self.global.lock();
                let removed = global.running.remove(&start_time);
                debug_assert!(removed, "transaction missing from global running table");
                if self.gc_enabled {
                    global.completed.push_front(Arc::clone(txn));
                }
            }
            Some(context) => {
                let removed = context.remove_running(start_time);
                debug_assert!(removed, "transaction missing from its worker's running table");
                if self.gc_enabled {
                    self.global.lock().completed.push_front(Arc::clone(txn));
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Rollback engine
    // -----------------------------------------------------------------------

    /// Undo one record. Restores the prior image and unlinks the slot's
    /// chain head, or does nothing when the record was never installed.
    ///
    /// Only an invalid-column error can come back, and only for a delta
    /// naming a column outside its own table's layout, which staging
    /// validated; `abort` treats it as an invariant breach.
    fn rollback(&self, txn: &TransactionContext, record: UndoIdx) -> Result<()> {
        let installed = self
            .buffer_pool
            .with_undo(record, |rec| rec.table().map(|t| (Arc::clone(t), rec.slot())))
            .flatten();
        let Some((table, slot)) = installed else {
            // Never entered a version chain (lost the write-write race).
            return Ok(());
        };
        let accessor = table.accessor();

        // We do not necessarily undo `record` itself but whatever record by
        // this transaction heads the chain; the counts match, so by the end
        // of abort every one of ours is gone.
        let head = accessor.read_version_ptr(slot);
        let Some(head_idx) = head else {
            debug_assert!(false, "rollback on a slot with an empty version chain");
            return Ok(());
        };
        let version = self.buffer_pool.with_undo(head_idx, |rec| {
            (
                rec.kind(),
                rec.delta().clone(),
                rec.next(),
                rec.timestamp().load(),
            )
        });
        let Some((kind, delta, next, stamp)) = version else {
            debug_assert!(false, "chain head reclaimed under a live writer");
            return Ok(());
        };
        debug_assert_eq!(
            stamp,
            txn.txn_id(),
            "rollback on a slot where this transaction does not hold the write lock"
        );

        let layout = accessor.layout();
        match kind {
            UndoRecordKind::Update => {
                for (column, cell) in delta.iter() {
                    // The in-place payload we are about to overwrite is
                    // orphaned; queue it for the GC.
                    if layout.is_varlen(column) {
                        if let Some(ColumnValue::Varlen(current)) =
                            accessor.read_cell(slot, column)?
                        {
                            txn.record_loose(current);
                        }
                    }
                    accessor.write_cell(slot, column, cell.cloned())?;
                }
            }
            UndoRecordKind::Insert => {
                for column in layout.user_columns() {
                    if layout.is_varlen(column) {
                        if let Some(ColumnValue::Varlen(current)) =
                            accessor.read_cell(slot, column)?
                        {
                            txn.record_loose(current);
                        }
                    }
                }
                accessor.set_present(slot, false);
                accessor.deallocate(slot);
            }
            UndoRecordKind::Delete => accessor.set_present(slot, true),
        }

        // Unlinking the head releases the write lock. The tuple is already
        // restored, and we still hold the lock, so a plain store is enough.
        accessor.write_version_ptr(slot, next);
        tracing::trace!(table = %table.id(), %slot, ?kind, "rolled back undo record");
        Ok(())
    }

    /// If the final write lost its race, its after-image was staged but the
    /// physical delta never installed. Rollback never saw it, so any
    /// varlen payloads inside are still owned here and must reach the
    /// loose list.
    fn gc_last_update_on_abort(&self, txn: &TransactionContext) {
        let redo = txn.redo_buffer.lock();
        let Some(LogRecord::Redo(last_redo)) = redo.last() else {
            // No updates, or the last write was a delete; deletes carry no
            // payloads.
            return;
        };
        let last_undo = txn.undo_buffer.lock().last();
        let Some(last_undo_idx) = last_undo else {
            return;
        };
        let installed = self.buffer_pool.with_undo(last_undo_idx, |rec| {
            debug_assert_eq!(
                rec.slot(),
                last_redo.slot(),
                "last undo and redo records must correspond"
            );
            rec.table().is_some()
        });
        if installed.unwrap_or(true) {
            // Installed updates are the GC's job to scan.
            return;
        }

        let layout = last_redo.table().accessor().layout();
        for (column, cell) in last_redo.delta().iter() {
            if layout.is_varlen(column) {
                if let Some(ColumnValue::Varlen(payload)) = cell {
                    txn.record_loose(payload.clone());
                }
            }
        }
    }
}

impl std::fmt::Debug for TransactionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let global = self.global.lock();
        f.debug_struct("TransactionManager")
            .field("time", &self.time.load())
            .field("global_running", &global.running.len())
            .field("completed", &global.completed.len())
            .field("workers", &self.workers.lock().len())
            .field("gc_enabled", &self.gc_enabled)
            .finish_non_exhaustive()
    }
}
