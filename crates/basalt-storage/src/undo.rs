//! Undo records, the arena that stores them, and the record buffer pool.
//!
//! Undo records outlive the transaction that wrote them: they form the
//! per-slot version chains that concurrent readers traverse, and they are
//! reclaimed only by the garbage collector once no live reader can need
//! them. They therefore live in a shared arena and are referenced by packed
//! [`UndoIdx`] handles, which fit in an `AtomicU64` so a slot's version
//! pointer can be read and replaced atomically.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;

use basalt_error::{BasaltError, Result};
use basalt_types::{AtomicTimestamp, Timestamp, TupleSlot};

use crate::table::DataTable;
use crate::value::ProjectedDelta;

// ---------------------------------------------------------------------------
// UndoIdx
// ---------------------------------------------------------------------------

/// Packed-u64 sentinel for "no version" (an empty version chain).
pub const VERSION_CHAIN_EMPTY: u64 = u64::MAX;

/// Index of an undo record within an [`UndoArena`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct UndoIdx {
    chunk: u32,
    offset: u32,
}

impl UndoIdx {
    #[inline]
    pub(crate) const fn new(chunk: u32, offset: u32) -> Self {
        Self { chunk, offset }
    }

    #[inline]
    #[must_use]
    pub fn chunk(self) -> u32 {
        self.chunk
    }

    #[inline]
    #[must_use]
    pub fn offset(self) -> u32 {
        self.offset
    }

    /// Pack into a u64 for atomic version-pointer storage.
    #[inline]
    #[must_use]
    pub fn pack(self) -> u64 {
        (u64::from(self.chunk) << 32) | u64::from(self.offset)
    }

    /// Unpack from a u64. `None` for [`VERSION_CHAIN_EMPTY`].
    #[inline]
    #[must_use]
    pub fn unpack(raw: u64) -> Option<Self> {
        if raw == VERSION_CHAIN_EMPTY {
            return None;
        }
        #[allow(clippy::cast_possible_truncation)]
        Some(Self::new((raw >> 32) as u32, raw as u32))
    }

    /// Pack an optional index, mapping `None` to the empty sentinel.
    #[inline]
    #[must_use]
    pub fn pack_opt(idx: Option<Self>) -> u64 {
        idx.map_or(VERSION_CHAIN_EMPTY, Self::pack)
    }
}

// ---------------------------------------------------------------------------
// UndoRecord
// ---------------------------------------------------------------------------

/// What kind of write an undo record reverses.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum UndoRecordKind {
    Update,
    Insert,
    Delete,
}

/// The prior image of a single write, linked into a per-slot version chain.
///
/// `table` is set exactly once, when the record is installed in a chain.
/// A record whose table was never set lost the write-write race: the
/// physical delta was never applied, and rollback skips it.
pub struct UndoRecord {
    kind: UndoRecordKind,
    table: OnceLock<Arc<DataTable>>,
    slot: TupleSlot,
    delta: ProjectedDelta,
    /// The writer's in-progress id until commit stamps the commit timestamp.
    timestamp: AtomicTimestamp,
    /// Chain link to the next-older version, set at install.
    next: OnceLock<Option<UndoIdx>>,
}

impl UndoRecord {
    #[must_use]
    pub fn new(
        kind: UndoRecordKind,
        slot: TupleSlot,
        delta: ProjectedDelta,
        txn_id: Timestamp,
    ) -> Self {
        Self {
            kind,
            table: OnceLock::new(),
            slot,
            delta,
            timestamp: AtomicTimestamp::new(txn_id),
            next: OnceLock::new(),
        }
    }

    #[inline]
    #[must_use]
    pub fn kind(&self) -> UndoRecordKind {
        self.kind
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

    #[inline]
    #[must_use]
    pub fn timestamp(&self) -> &AtomicTimestamp {
        &self.timestamp
    }

    /// The table this record is installed in, or `None` if it never was.
    #[inline]
    #[must_use]
    pub fn table(&self) -> Option<&Arc<DataTable>> {
        self.table.get()
    }

    /// Mark the record installed. May be called at most once.
    pub(crate) fn set_table(&self, table: Arc<DataTable>) {
        let installed = self.table.set(table).is_ok();
        debug_assert!(installed, "undo record installed twice");
    }

    /// The next-older version in the chain. `None` both for the chain tail
    /// and for records that were never installed.
    #[inline]
    #[must_use]
    pub fn next(&self) -> Option<UndoIdx> {
        self.next.get().copied().flatten()
    }

    pub(crate) fn set_next(&self, next: Option<UndoIdx>) {
        let fresh = self.next.set(next).is_ok();
        debug_assert!(fresh, "undo record chained twice");
    }
}

impl std::fmt::Debug for UndoRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UndoRecord")
            .field("kind", &self.kind)
            .field("slot", &self.slot)
            .field("installed", &self.table.get().is_some())
            .field("timestamp", &self.timestamp.load())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// UndoArena
// ---------------------------------------------------------------------------

/// Number of undo records per arena chunk.
const ARENA_CHUNK: usize = 4096;

/// Chunked storage for [`UndoRecord`]s with a free list.
///
/// Indices are stable for the life of a record: chunks are never moved or
/// shrunk, only appended. Freed slots are recycled via the free list.
pub struct UndoArena {
    chunks: Vec<Vec<Option<UndoRecord>>>,
    free_list: Vec<UndoIdx>,
    high_water: u64,
}

impl UndoArena {
    #[must_use]
    pub fn new() -> Self {
        Self {
            chunks: vec![Vec::with_capacity(ARENA_CHUNK)],
            free_list: Vec::new(),
            high_water: 0,
        }
    }

    /// Allocate a slot for `record`, returning its index.
    pub fn alloc(&mut self, record: UndoRecord) -> UndoIdx {
        if let Some(idx) = self.free_list.pop() {
            self.chunks[idx.chunk as usize][idx.offset as usize] = Some(record);
            return idx;
        }

        let last = self.chunks.len() - 1;
        if self.chunks[last].len() >= ARENA_CHUNK {
            self.chunks.push(Vec::with_capacity(ARENA_CHUNK));
        }

        let chunk = self.chunks.len() - 1;
        let offset = self.chunks[chunk].len();
        self.chunks[chunk].push(Some(record));
        self.high_water += 1;

        let chunk_u32 = u32::try_from(chunk).expect("UndoArena chunk index overflow u32");
        let offset_u32 = u32::try_from(offset).expect("UndoArena offset overflow u32");
        UndoIdx::new(chunk_u32, offset_u32)
    }

    /// Free the slot at `idx`.
    ///
    /// # Panics
    ///
    /// Asserts that the slot is currently occupied (catches double-free).
    pub fn free(&mut self, idx: UndoIdx) {
        let slot = &mut self.chunks[idx.chunk as usize][idx.offset as usize];
        assert!(slot.is_some(), "UndoArena::free: double-free of {idx:?}");
        *slot = None;
        self.free_list.push(idx);
    }

    #[must_use]
    pub fn get(&self, idx: UndoIdx) -> Option<&UndoRecord> {
        self.chunks
            .get(idx.chunk as usize)?
            .get(idx.offset as usize)?
            .as_ref()
    }

    /// Total records ever allocated (including freed).
    #[must_use]
    pub fn high_water(&self) -> u64 {
        self.high_water
    }

    #[must_use]
    pub fn free_count(&self) -> usize {
        self.free_list.len()
    }

    #[must_use]
    pub fn chunk_count(&self) -> usize {
        self.chunks.len()
    }
}

impl Default for UndoArena {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for UndoArena {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UndoArena")
            .field("chunk_count", &self.chunks.len())
            .field("free_count", &self.free_list.len())
            .field("high_water", &self.high_water)
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// RecordBufferPool
// ---------------------------------------------------------------------------

/// Supplies undo and redo record segments to transactions.
///
/// Owns the shared [`UndoArena`] and a segment budget covering both undo
/// allocations and staged redo records. The budget bounds the memory a burst
/// of large transactions can pin; exhaustion surfaces as
/// [`BasaltError::BufferPoolExhausted`] from the staging call.
pub struct RecordBufferPool {
    arena: RwLock<UndoArena>,
    segments_in_use: AtomicUsize,
    capacity: usize,
}

impl RecordBufferPool {
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            arena: RwLock::new(UndoArena::new()),
            segments_in_use: AtomicUsize::new(0),
            capacity,
        }
    }

    /// Reserve one segment from the budget.
    pub fn reserve_segment(&self) -> Result<()> {
        let prev = self.segments_in_use.fetch_add(1, Ordering::SeqCst);
        if prev >= self.capacity {
            self.segments_in_use.fetch_sub(1, Ordering::SeqCst);
            return Err(BasaltError::BufferPoolExhausted {
                in_use: prev,
                capacity: self.capacity,
            });
        }
        Ok(())
    }

    /// Return one segment to the budget.
    pub fn release_segment(&self) {
        let prev = self.segments_in_use.fetch_sub(1, Ordering::SeqCst);
        debug_assert!(prev > 0, "segment budget underflow");
    }

    /// Allocate `record` into the arena against the budget.
    pub fn alloc_undo(&self, record: UndoRecord) -> Result<UndoIdx> {
        self.reserve_segment()?;
        Ok(self.arena.write().alloc(record))
    }

    /// Free an undo record and return its segment. Called by the GC once the
    /// record is unreachable.
    pub fn free_undo(&self, idx: UndoIdx) {
        self.arena.write().free(idx);
        self.release_segment();
    }

    /// Run `f` against the record at `idx`. `None` if the slot is free.
    pub fn with_undo<R>(&self, idx: UndoIdx, f: impl FnOnce(&UndoRecord) -> R) -> Option<R> {
        let arena = self.arena.read();
        arena.get(idx).map(f)
    }

    #[must_use]
    pub fn segments_in_use(&self) -> usize {
        self.segments_in_use.load(Ordering::SeqCst)
    }

    #[must_use]
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl std::fmt::Debug for RecordBufferPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecordBufferPool")
            .field("segments_in_use", &self.segments_in_use())
            .field("capacity", &self.capacity)
            .finish_non_exhaustive()
    }
}
