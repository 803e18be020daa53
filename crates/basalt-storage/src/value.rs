//! Column values and projections.
//!
//! A cell is `Option<ColumnValue>` (`None` = SQL null). Fixed-width values
//! are stored inline; variable-length values are handles to shared immutable
//! payloads. A clone of a [`VarlenEntry`] handle is what the transaction
//! manager records as a "loose pointer": ownership of the payload passes to
//! the GC, which frees it by dropping the handle once the owning transaction
//! is unreachable.

use std::sync::Arc;

use smallvec::SmallVec;

use basalt_error::{BasaltError, Result};
use basalt_types::ColumnId;

/// Handle to an immutable variable-length payload.
#[derive(Clone, PartialEq, Eq)]
pub struct VarlenEntry {
    bytes: Arc<[u8]>,
}

impl VarlenEntry {
    #[must_use]
    pub fn new(bytes: impl Into<Arc<[u8]>>) -> Self {
        Self {
            bytes: bytes.into(),
        }
    }

    #[must_use]
    pub fn from_slice(bytes: &[u8]) -> Self {
        Self { bytes: bytes.into() }
    }

    #[inline]
    #[must_use]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Whether another handle refers to the same payload allocation.
    #[inline]
    #[must_use]
    pub fn same_payload(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.bytes, &other.bytes)
    }
}

impl std::fmt::Debug for VarlenEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VarlenEntry")
            .field("len", &self.bytes.len())
            .finish_non_exhaustive()
    }
}

/// A single column value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ColumnValue {
    /// Fixed-width value, stored inline.
    Fixed(u64),
    /// Variable-length value, stored as a shared payload handle.
    Varlen(VarlenEntry),
}

impl ColumnValue {
    #[inline]
    #[must_use]
    pub fn as_fixed(&self) -> Option<u64> {
        match self {
            Self::Fixed(v) => Some(*v),
            Self::Varlen(_) => None,
        }
    }

    #[inline]
    #[must_use]
    pub fn as_varlen(&self) -> Option<&VarlenEntry> {
        match self {
            Self::Fixed(_) => None,
            Self::Varlen(v) => Some(v),
        }
    }

    #[inline]
    #[must_use]
    pub fn is_varlen(&self) -> bool {
        matches!(self, Self::Varlen(_))
    }
}

/// A projection over a subset of a table's columns: parallel lists of column
/// ids and cells.
///
/// Used both as the after-image of a redo record and as the before-image of
/// an undo record.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ProjectedDelta {
    columns: SmallVec<[ColumnId; 4]>,
    values: SmallVec<[Option<ColumnValue>; 4]>,
}

impl ProjectedDelta {
    /// Build a projection from parallel column and value lists.
    pub fn new(
        columns: impl IntoIterator<Item = ColumnId>,
        values: impl IntoIterator<Item = Option<ColumnValue>>,
    ) -> Result<Self> {
        let columns: SmallVec<[ColumnId; 4]> = columns.into_iter().collect();
        let values: SmallVec<[Option<ColumnValue>; 4]> = values.into_iter().collect();
        if columns.len() != values.len() {
            return Err(BasaltError::ProjectionArityMismatch {
                columns: columns.len(),
                values: values.len(),
            });
        }
        Ok(Self { columns, values })
    }

    /// The empty projection (insert and delete undo records carry one).
    #[must_use]
    pub fn empty() -> Self {
        Self::default()
    }

    #[inline]
    #[must_use]
    pub fn len(&self) -> usize {
        self.columns.len()
    }

    #[inline]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    #[inline]
    #[must_use]
    pub fn columns(&self) -> &[ColumnId] {
        &self.columns
    }

    /// The cell at projection index `i`.
    #[inline]
    #[must_use]
    pub fn value(&self, i: usize) -> Option<&ColumnValue> {
        self.values.get(i).and_then(Option::as_ref)
    }

    /// Iterate `(column, cell)` pairs.
    pub fn iter(&self) -> impl Iterator<Item = (ColumnId, Option<&ColumnValue>)> {
        self.columns
            .iter()
            .copied()
            .zip(self.values.iter().map(Option::as_ref))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn varlen_handles_share_payloads() {
        let a = VarlenEntry::from_slice(b"the quick brown fox");
        let b = a.clone();
        assert!(a.same_payload(&b));
        assert_eq!(a, VarlenEntry::from_slice(b"the quick brown fox"));
        assert!(!a.same_payload(&VarlenEntry::from_slice(b"the quick brown fox")));
    }

    #[test]
    fn delta_arity_is_checked() {
        let err = ProjectedDelta::new(
            [ColumnId::new(1), ColumnId::new(2)],
            [Some(ColumnValue::Fixed(5))],
        )
        .unwrap_err();
        assert!(matches!(
            err,
            basalt_error::BasaltError::ProjectionArityMismatch {
                columns: 2,
                values: 1
            }
        ));
    }

    #[test]
    fn delta_iteration() {
        let delta = ProjectedDelta::new(
            [ColumnId::new(1), ColumnId::new(2)],
            [Some(ColumnValue::Fixed(5)), None],
        )
        .unwrap();
        let pairs: Vec<_> = delta.iter().collect();
        assert_eq!(pairs.len(), 2);
        assert_eq!(pairs[0].0, ColumnId::new(1));
        assert_eq!(pairs[0].1, Some(&ColumnValue::Fixed(5)));
        assert_eq!(pairs[1].1, None);
    }
}
