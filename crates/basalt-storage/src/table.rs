//! The versioned data table and its tuple accessor.
//!
//! Each slot carries a packed atomic version pointer (the head of the
//! slot's undo chain), a present bit (the null bit of the reserved
//! version-pointer column; clear = logically deleted), an allocated bit,
//! and the column cells under a per-slot latch.
//!
//! A transaction holds the write lock on a slot iff the chain head's stamp
//! equals the transaction's in-progress id. Installs go through a CAS on
//! the packed head, so two racing writers resolve without blocking: the
//! loser's undo record is left uninstalled (its table marker unset), which
//! is how the transaction manager learns about the lost race.
//!
//! Lock discipline: the arena lock (inside the record buffer pool) and a
//! slot's cell latch are never held at the same time.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, MutexGuard};

use basalt_error::{BasaltError, Result};
use basalt_types::{TableId, Timestamp, TupleSlot};

use crate::layout::BlockLayout;
use crate::redo::{LogRecord, RedoRecord};
use crate::undo::{RecordBufferPool, UndoIdx, UndoRecord, UndoRecordKind, VERSION_CHAIN_EMPTY};
use crate::value::{ColumnValue, ProjectedDelta};

/// What the data table needs from the transaction driving an operation.
///
/// Implemented by the transaction context; the trait keeps the storage
/// layer independent of the transaction manager crate.
pub trait TransactionHandle: Send + Sync {
    /// The transaction's start timestamp (its snapshot).
    fn start_time(&self) -> Timestamp;

    /// The transaction's current id: the biased in-progress id until
    /// commit, the commit timestamp after.
    fn txn_id(&self) -> Timestamp;

    /// Append an undo record to the transaction's undo buffer, allocating
    /// it into the shared arena.
    fn stage_undo(&self, record: UndoRecord) -> Result<UndoIdx>;

    /// Append a log record to the transaction's redo buffer.
    fn stage_redo(&self, record: LogRecord) -> Result<()>;
}

// ---------------------------------------------------------------------------
// TupleAccessStrategy
// ---------------------------------------------------------------------------

struct SlotState {
    version_ptr: AtomicU64,
    allocated: AtomicBool,
    present: AtomicBool,
    cells: Mutex<Vec<Option<ColumnValue>>>,
}

impl SlotState {
    fn new(num_user_columns: usize) -> Self {
        Self {
            version_ptr: AtomicU64::new(VERSION_CHAIN_EMPTY),
            allocated: AtomicBool::new(false),
            present: AtomicBool::new(false),
            cells: Mutex::new(vec![None; num_user_columns]),
        }
    }
}

/// Physical access to a fixed-capacity block of slots.
pub struct TupleAccessStrategy {
    layout: BlockLayout,
    slots: Vec<SlotState>,
    free: Mutex<Vec<u32>>,
    next_unused: AtomicU32,
}

impl TupleAccessStrategy {
    #[must_use]
    pub fn new(layout: BlockLayout, capacity: usize) -> Self {
        let slots = (0..capacity)
            .map(|_| SlotState::new(layout.num_user_columns()))
            .collect();
        Self {
            layout,
            slots,
            free: Mutex::new(Vec::new()),
            next_unused: AtomicU32::new(0),
        }
    }

    #[inline]
    #[must_use]
    pub fn layout(&self) -> &BlockLayout {
        &self.layout
    }

    #[inline]
    #[must_use]
    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    fn state(&self, slot: TupleSlot) -> &SlotState {
        &self.slots[slot.index()]
    }

    /// Claim a free slot, or `None` if the block is full.
    pub fn allocate(&self) -> Option<TupleSlot> {
        let reused = self.free.lock().pop();
        let raw = match reused {
            Some(raw) => raw,
            None => {
                let raw = self.next_unused.fetch_add(1, Ordering::SeqCst);
                if raw as usize >= self.slots.len() {
                    // Undo the bump so the counter cannot creep past
                    // capacity under repeated full-table inserts.
                    self.next_unused.fetch_sub(1, Ordering::SeqCst);
                    return None;
                }
                raw
            }
        };
        let slot = TupleSlot::new(raw);
        self.state(slot).allocated.store(true, Ordering::SeqCst);
        Some(slot)
    }

    /// Return a slot to the free pool, dropping its cell contents.
    pub fn deallocate(&self, slot: TupleSlot) {
        let state = self.state(slot);
        {
            let mut cells = state.cells.lock();
            cells.fill(None);
        }
        state.allocated.store(false, Ordering::SeqCst);
        self.free.lock().push(slot.get());
    }

    #[inline]
    #[must_use]
    pub fn is_allocated(&self, slot: TupleSlot) -> bool {
        self.state(slot).allocated.load(Ordering::SeqCst)
    }

    /// Set or clear the null bit of the version-pointer column. Clear
    /// means logically deleted.
    pub fn set_present(&self, slot: TupleSlot, present: bool) {
        self.state(slot).present.store(present, Ordering::SeqCst);
    }

    #[inline]
    #[must_use]
    pub fn is_present(&self, slot: TupleSlot) -> bool {
        self.state(slot).present.load(Ordering::SeqCst)
    }

    /// Atomically read the slot's version-chain head.
    #[must_use]
    pub fn read_version_ptr(&self, slot: TupleSlot) -> Option<UndoIdx> {
        UndoIdx::unpack(self.state(slot).version_ptr.load(Ordering::SeqCst))
    }

    /// Atomically replace the slot's version-chain head. Valid only while
    /// the caller holds the slot's write lock (or owns the slot privately).
    pub fn write_version_ptr(&self, slot: TupleSlot, head: Option<UndoIdx>) {
        self.state(slot)
            .version_ptr
            .store(UndoIdx::pack_opt(head), Ordering::SeqCst);
    }

    /// Publish `new` as the chain head iff the head still equals
    /// `expected`. Returns whether the swap happened.
    pub fn compare_and_swap_version_ptr(
        &self,
        slot: TupleSlot,
        expected: Option<UndoIdx>,
        new: Option<UndoIdx>,
    ) -> bool {
        self.state(slot)
            .version_ptr
            .compare_exchange(
                UndoIdx::pack_opt(expected),
                UndoIdx::pack_opt(new),
                Ordering::SeqCst,
                Ordering::SeqCst,
            )
            .is_ok()
    }

    /// Read one cell.
    ///
    /// # Errors
    ///
    /// [`BasaltError::InvalidColumn`] on a reserved or out-of-layout column.
    pub fn read_cell(
        &self,
        slot: TupleSlot,
        column: basalt_types::ColumnId,
    ) -> Result<Option<ColumnValue>> {
        let idx = self
            .layout
            .user_index(column)
            .ok_or(BasaltError::InvalidColumn { column })?;
        Ok(self.state(slot).cells.lock()[idx].clone())
    }

    /// Write one cell.
    ///
    /// # Errors
    ///
    /// [`BasaltError::InvalidColumn`] on a reserved or out-of-layout column.
    pub fn write_cell(
        &self,
        slot: TupleSlot,
        column: basalt_types::ColumnId,
        cell: Option<ColumnValue>,
    ) -> Result<()> {
        let idx = self
            .layout
            .user_index(column)
            .ok_or(BasaltError::InvalidColumn { column })?;
        self.state(slot).cells.lock()[idx] = cell;
        Ok(())
    }

    /// Copy the slot's cells, chain head, and present bit as one consistent
    /// snapshot.
    #[must_use]
    pub fn snapshot(&self, slot: TupleSlot) -> (Vec<Option<ColumnValue>>, Option<UndoIdx>, bool) {
        let state = self.state(slot);
        let cells = state.cells.lock();
        let head = UndoIdx::unpack(state.version_ptr.load(Ordering::SeqCst));
        let present = state.present.load(Ordering::SeqCst);
        (cells.clone(), head, present)
    }

    pub(crate) fn cells_guard(&self, slot: TupleSlot) -> MutexGuard<'_, Vec<Option<ColumnValue>>> {
        self.state(slot).cells.lock()
    }
}

impl std::fmt::Debug for TupleAccessStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TupleAccessStrategy")
            .field("capacity", &self.slots.len())
            .field("num_columns", &self.layout.num_columns())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// DataTable
// ---------------------------------------------------------------------------

/// A versioned table: slot storage plus the install protocol for undo
/// records.
pub struct DataTable {
    id: TableId,
    accessor: TupleAccessStrategy,
    pool: Arc<RecordBufferPool>,
}

impl DataTable {
    #[must_use]
    pub fn new(
        id: TableId,
        layout: BlockLayout,
        capacity: usize,
        pool: Arc<RecordBufferPool>,
    ) -> Self {
        Self {
            id,
            accessor: TupleAccessStrategy::new(layout, capacity),
            pool,
        }
    }

    #[inline]
    #[must_use]
    pub fn id(&self) -> TableId {
        self.id
    }

    #[inline]
    #[must_use]
    pub fn accessor(&self) -> &TupleAccessStrategy {
        &self.accessor
    }

    #[inline]
    #[must_use]
    pub fn pool(&self) -> &Arc<RecordBufferPool> {
        &self.pool
    }

    /// Insert a full tuple. The fresh slot is private to the transaction
    /// until this returns, so the insert's undo record is installed at
    /// creation; no CAS is needed.
    pub fn insert(
        self: &Arc<Self>,
        txn: &dyn TransactionHandle,
        cells: Vec<Option<ColumnValue>>,
    ) -> Result<TupleSlot> {
        let layout = self.accessor.layout();
        if cells.len() != layout.num_user_columns() {
            return Err(BasaltError::ProjectionArityMismatch {
                columns: layout.num_user_columns(),
                values: cells.len(),
            });
        }
        for (column, cell) in layout.user_columns().zip(cells.iter()) {
            if !layout.accepts(column, cell.as_ref()) {
                return Err(BasaltError::ValueKindMismatch {
                    column,
                    expected: expected_kind_name(layout, column),
                });
            }
        }

        let slot = self.accessor.allocate().ok_or(BasaltError::TableFull {
            capacity: self.accessor.capacity(),
        })?;

        let undo = UndoRecord::new(
            UndoRecordKind::Insert,
            slot,
            ProjectedDelta::empty(),
            txn.txn_id(),
        );
        undo.set_table(Arc::clone(self));
        undo.set_next(None);
        let idx = match txn.stage_undo(undo) {
            Ok(idx) => idx,
            Err(e) => {
                self.accessor.deallocate(slot);
                return Err(e);
            }
        };

        {
            let mut guard = self.accessor.cells_guard(slot);
            guard.clone_from(&cells);
        }
        self.accessor.write_version_ptr(slot, Some(idx));
        self.accessor.set_present(slot, true);

        let after = ProjectedDelta::new(layout.user_columns(), cells)?;
        txn.stage_redo(LogRecord::Redo(RedoRecord::new(
            Arc::clone(self),
            slot,
            after,
        )))?;

        tracing::trace!(table = %self.id, %slot, "insert installed");
        Ok(slot)
    }

    /// Apply `delta` to a slot. Returns `false` on a write-write conflict;
    /// the staged undo record is then left uninstalled, which the abort
    /// path recognizes as the lost-race marker.
    pub fn update(
        self: &Arc<Self>,
        txn: &dyn TransactionHandle,
        slot: TupleSlot,
        delta: ProjectedDelta,
    ) -> Result<bool> {
        self.check_slot(slot)?;
        let layout = self.accessor.layout();
        for (column, cell) in delta.iter() {
            if !layout.accepts(column, cell) {
                return Err(BasaltError::ValueKindMismatch {
                    column,
                    expected: expected_kind_name(layout, column),
                });
            }
        }

        // The after-image is staged before the install attempt; on a lost
        // race it stays in the redo buffer, paired with the uninstalled
        // undo record.
        txn.stage_redo(LogRecord::Redo(RedoRecord::new(
            Arc::clone(self),
            slot,
            delta.clone(),
        )))?;

        // Capture the before image and the expected chain head together.
        let (before, expected_head) = {
            let guard = self.accessor.cells_guard(slot);
            let head = self.accessor.read_version_ptr(slot);
            let before = ProjectedDelta::new(
                delta.columns().iter().copied(),
                delta
                    .columns()
                    .iter()
                    .map(|c| guard[layout.user_index(*c).expect("validated column")].clone()),
            )?;
            (before, head)
        };

        let undo = UndoRecord::new(UndoRecordKind::Update, slot, before, txn.txn_id());
        let idx = txn.stage_undo(undo)?;

        if !self.try_install(txn, slot, idx, expected_head) {
            tracing::debug!(table = %self.id, %slot, txn = %txn.txn_id(), "update lost write-write race");
            return Ok(false);
        }

        let mut guard = self.accessor.cells_guard(slot);
        for (column, cell) in delta.iter() {
            guard[layout.user_index(column).expect("validated column")] = cell.cloned();
        }
        Ok(true)
    }

    /// Logically delete a slot. Returns `false` on a write-write conflict.
    pub fn delete(self: &Arc<Self>, txn: &dyn TransactionHandle, slot: TupleSlot) -> Result<bool> {
        self.check_slot(slot)?;

        txn.stage_redo(LogRecord::Delete {
            table: Arc::clone(self),
            slot,
        })?;

        let expected_head = self.accessor.read_version_ptr(slot);
        let undo = UndoRecord::new(
            UndoRecordKind::Delete,
            slot,
            ProjectedDelta::empty(),
            txn.txn_id(),
        );
        let idx = txn.stage_undo(undo)?;

        if !self.try_install(txn, slot, idx, expected_head) {
            tracing::debug!(table = %self.id, %slot, txn = %txn.txn_id(), "delete lost write-write race");
            return Ok(false);
        }

        self.accessor.set_present(slot, false);
        Ok(true)
    }

    /// Snapshot read: the tuple as of the transaction's start time, with
    /// the transaction's own uncommitted writes visible. `None` if the
    /// tuple does not exist in that snapshot.
    #[must_use]
    pub fn select(
        &self,
        txn: &dyn TransactionHandle,
        slot: TupleSlot,
    ) -> Option<Vec<Option<ColumnValue>>> {
        if slot.index() >= self.accessor.capacity() || !self.accessor.is_allocated(slot) {
            return None;
        }
        let (mut cells, head, mut present) = self.accessor.snapshot(slot);

        let layout = self.accessor.layout();
        let mut cursor = head;
        while let Some(idx) = cursor {
            let step = self.pool.with_undo(idx, |rec| {
                let stamp = rec.timestamp().load();
                if visible_to(stamp, txn) {
                    return None;
                }
                // Not visible: apply the before image and keep walking.
                match rec.kind() {
                    UndoRecordKind::Update => {
                        for (column, cell) in rec.delta().iter() {
                            cells[layout.user_index(column).expect("layout column")] =
                                cell.cloned();
                        }
                    }
                    UndoRecordKind::Insert => present = false,
                    UndoRecordKind::Delete => present = true,
                }
                Some(rec.next())
            });
            match step {
                Some(Some(next)) => cursor = next,
                Some(None) => break,
                None => {
                    // Reclaimed while we walked; the GC contract says this
                    // version was below the watermark, so it cannot have
                    // been needed.
                    debug_assert!(false, "version chain truncated under a live reader");
                    break;
                }
            }
        }

        present.then_some(cells)
    }

    fn check_slot(&self, slot: TupleSlot) -> Result<()> {
        if slot.index() >= self.accessor.capacity() {
            return Err(BasaltError::SlotOutOfBounds {
                slot,
                capacity: self.accessor.capacity(),
            });
        }
        if !self.accessor.is_allocated(slot) {
            return Err(BasaltError::SlotNotAllocated { slot });
        }
        Ok(())
    }

    /// Conflict-check and publish `idx` as the slot's chain head.
    fn try_install(
        self: &Arc<Self>,
        txn: &dyn TransactionHandle,
        slot: TupleSlot,
        idx: UndoIdx,
        expected_head: Option<UndoIdx>,
    ) -> bool {
        let present = self.accessor.is_present(slot);
        if let Some(head) = expected_head {
            let stamp = self.pool.with_undo(head, |rec| rec.timestamp().load());
            let Some(stamp) = stamp else {
                // Head reclaimed out from under a would-be writer: the
                // chain moved; treat as a lost race.
                return false;
            };
            let own = stamp == txn.txn_id();
            let conflict = if stamp.is_uncommitted() {
                // Own writes never conflict, deleted or not: a transaction
                // may sequence further writes over its own delete.
                !own
            } else {
                // A committed absent tuple is unwritable even when the
                // deleting commit predates this snapshot.
                !present || stamp > txn.start_time()
            };
            if conflict {
                return false;
            }
        } else if !present {
            // Empty chain and no tuple: nothing to write over.
            return false;
        }
        let linked = self.pool.with_undo(idx, |rec| rec.set_next(expected_head));
        debug_assert!(linked.is_some(), "staged undo record reclaimed before install");
        if !self
            .accessor
            .compare_and_swap_version_ptr(slot, expected_head, Some(idx))
        {
            return false;
        }
        let marked = self
            .pool
            .with_undo(idx, |rec| rec.set_table(Arc::clone(self)));
        debug_assert!(marked.is_some(), "installed undo record reclaimed in place");
        true
    }
}

impl std::fmt::Debug for DataTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DataTable")
            .field("id", &self.id)
            .field("capacity", &self.accessor.capacity())
            .finish_non_exhaustive()
    }
}

/// Whether a version stamped `stamp` is visible to `txn`: its own writes
/// always are; otherwise only commits at or before its snapshot.
#[inline]
fn visible_to(stamp: Timestamp, txn: &dyn TransactionHandle) -> bool {
    stamp == txn.txn_id() || (!stamp.is_uncommitted() && stamp <= txn.start_time())
}

fn expected_kind_name(layout: &BlockLayout, column: basalt_types::ColumnId) -> &'static str {
    match layout.kind(column) {
        Some(crate::layout::ColumnKind::Fixed) => "fixed",
        Some(crate::layout::ColumnKind::Varlen) => "varlen",
        None => "user column",
    }
}
