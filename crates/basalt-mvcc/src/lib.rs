//! MVCC transaction management for the basalt engine.
//!
//! This crate owns the transaction lifecycle: it mints monotonically
//! increasing timestamps, tracks the set of live transactions (per-worker
//! shards plus a global fallback), serializes update-commit records against
//! the write-ahead log, rolls back in-flight updates on abort, and buffers
//! completed transactions for the garbage collector.
//!
//! The storage layer installs delta records and reports write-write
//! conflicts indirectly, as an undo record that never made it into a
//! version chain, so `begin`, `commit`, and `abort` are infallible for correct
//! callers.

pub mod context;
pub mod manager;

pub use context::{TransactionContext, TransactionQueue, UndoBuffer, WorkerContext};
pub use manager::TransactionManager;
