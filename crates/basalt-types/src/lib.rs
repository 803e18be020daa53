//! Core identifier types shared across the basalt engine.
//!
//! Everything here is a thin `#[repr(transparent)]` newtype over an integer.
//! The one type with real semantics is [`Timestamp`], which carries the
//! engine's bias encoding for in-progress transaction ids: a transaction
//! writing under start time `s` stamps its versions with `s + i64::MIN`,
//! which is negative, so readers can distinguish in-progress writes from
//! committed ones by sign alone.

pub mod encoding;

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};

/// A point on the engine's logical clock.
///
/// Timestamps are signed 64-bit integers. Start and commit timestamps drawn
/// from the oracle are non-negative and strictly increasing; wrap-around is
/// not handled (it cannot occur within the lifetime of a running system).
/// Negative values are in-progress transaction ids produced by
/// [`Timestamp::to_txn_id`].
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct Timestamp(i64);

impl Timestamp {
    /// The first timestamp the oracle hands out.
    pub const ZERO: Self = Self(0);

    /// Bias added to a start time to form an in-progress transaction id.
    ///
    /// `i64::MIN` flips the sign bit, so every in-progress id is negative
    /// and compares below every committed stamp.
    pub const BIAS: i64 = i64::MIN;

    #[inline]
    pub const fn new(raw: i64) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn get(self) -> i64 {
        self.0
    }

    /// The in-progress transaction id for a transaction with this start time.
    #[inline]
    #[must_use]
    pub const fn to_txn_id(self) -> Self {
        Self(self.0.wrapping_add(Self::BIAS))
    }

    /// Recover the start time from an in-progress transaction id.
    #[inline]
    #[must_use]
    pub const fn from_txn_id(self) -> Self {
        Self(self.0.wrapping_sub(Self::BIAS))
    }

    /// Whether this stamp is an in-progress transaction id rather than a
    /// committed timestamp.
    #[inline]
    #[must_use]
    pub const fn is_uncommitted(self) -> bool {
        self.0 < 0
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.is_uncommitted() {
            write!(f, "txn@{}", self.from_txn_id().get())
        } else {
            write!(f, "ts#{}", self.0)
        }
    }
}

/// Atomic cell holding a [`Timestamp`].
///
/// Used for version stamps that flip from an in-progress id to a commit
/// timestamp while readers may be looking, and for the oracle itself.
#[derive(Debug)]
#[repr(transparent)]
pub struct AtomicTimestamp(AtomicI64);

impl AtomicTimestamp {
    #[inline]
    pub const fn new(ts: Timestamp) -> Self {
        Self(AtomicI64::new(ts.get()))
    }

    #[inline]
    pub fn load(&self) -> Timestamp {
        Timestamp::new(self.0.load(Ordering::SeqCst))
    }

    #[inline]
    pub fn store(&self, ts: Timestamp) {
        self.0.store(ts.get(), Ordering::SeqCst);
    }

    /// Return the current value and advance the clock by one tick.
    #[inline]
    pub fn fetch_tick(&self) -> Timestamp {
        Timestamp::new(self.0.fetch_add(1, Ordering::SeqCst))
    }
}

/// Identifier of a registered worker thread.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct WorkerId(u32);

impl WorkerId {
    #[inline]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for WorkerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "worker#{}", self.0)
    }
}

/// Identifier of a data table, carried by redo records so the log is
/// self-describing.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct TableId(u32);

impl TableId {
    #[inline]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for TableId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "table#{}", self.0)
    }
}

/// Index of a column within a block layout.
///
/// Column 0 is reserved for the version pointer; user columns start at
/// [`NUM_RESERVED_COLUMNS`].
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct ColumnId(u16);

impl ColumnId {
    #[inline]
    pub const fn new(raw: u16) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn get(self) -> u16 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for ColumnId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "col#{}", self.0)
    }
}

/// The reserved column holding the version pointer and the logical-delete
/// null bit.
pub const VERSION_POINTER_COLUMN: ColumnId = ColumnId::new(0);

/// Number of reserved columns at the front of every layout.
pub const NUM_RESERVED_COLUMNS: u16 = 1;

/// Location of a tuple: a slot index within its table's block.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct TupleSlot(u32);

impl TupleSlot {
    #[inline]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn get(self) -> u32 {
        self.0
    }

    #[inline]
    #[must_use]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for TupleSlot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "slot#{}", self.0)
    }
}
