//! Storage-side machinery for the basalt engine: block layouts, column
//! values, undo records and their arena, redo-side log records, and the
//! versioned data table the rollback engine operates on.

pub mod layout;
pub mod redo;
pub mod table;
pub mod undo;
pub mod value;

pub use layout::{BlockLayout, ColumnKind};
pub use redo::{CommitCallback, CommitRecord, LogRecord, LogSink, RedoBuffer, RedoRecord};
pub use table::{DataTable, TransactionHandle, TupleAccessStrategy};
pub use undo::{
    RecordBufferPool, UndoArena, UndoIdx, UndoRecord, UndoRecordKind, VERSION_CHAIN_EMPTY,
};
pub use value::{ColumnValue, ProjectedDelta, VarlenEntry};
