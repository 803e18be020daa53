use basalt_types::{ColumnId, TupleSlot};
use thiserror::Error;

/// Primary error type for basalt storage and log operations.
///
/// The transaction lifecycle itself (`begin`/`commit`/`abort`) is
/// infallible for correct callers; internal invariant violations there are
/// debug assertions, not errors. Everything that can legitimately fail at
/// runtime (allocation against the record buffer pool, tuple access, log
/// I/O) surfaces here.
#[derive(Error, Debug)]
pub enum BasaltError {
    // === Record buffer pool ===
    /// The pool's segment budget is exhausted.
    #[error("record buffer pool exhausted: {in_use} of {capacity} segments in use")]
    BufferPoolExhausted { in_use: usize, capacity: usize },

    // === Tuple access ===
    /// Slot index beyond the table's block capacity.
    #[error("{slot} out of bounds for block of {capacity} slots")]
    SlotOutOfBounds { slot: TupleSlot, capacity: usize },

    /// Access to a slot that has not been allocated.
    #[error("{slot} is not allocated")]
    SlotNotAllocated { slot: TupleSlot },

    /// The table's block has no free slots left.
    #[error("table block is full ({capacity} slots)")]
    TableFull { capacity: usize },

    /// Column id outside the table's layout, or a reserved column.
    #[error("{column} is not a user column of this layout")]
    InvalidColumn { column: ColumnId },

    /// A value's kind does not match the layout's column kind.
    #[error("value kind mismatch at {column}: expected {expected}")]
    ValueKindMismatch {
        column: ColumnId,
        expected: &'static str,
    },

    /// A projection's column and value lists disagree in length.
    #[error("projection arity mismatch: {columns} columns, {values} values")]
    ProjectionArityMismatch { columns: usize, values: usize },

    // === Log ===
    /// File I/O error in the log manager.
    #[error("log I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A log frame failed its checksum or structural checks.
    #[error("log corrupt at offset {offset}: {detail}")]
    LogCorrupt { offset: u64, detail: String },
}

/// Result type alias using [`BasaltError`].
pub type Result<T> = std::result::Result<T, BasaltError>;
