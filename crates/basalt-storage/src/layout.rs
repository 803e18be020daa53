//! Block layouts: which columns a table has and which of them are
//! variable-length.
//!
//! Column 0 of every layout is reserved for the version pointer (and its
//! null bit, which doubles as the logical-delete marker). User columns start
//! at [`NUM_RESERVED_COLUMNS`].

use basalt_types::{ColumnId, NUM_RESERVED_COLUMNS};

use crate::value::ColumnValue;

/// Storage class of a user column.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ColumnKind {
    /// Fixed-width, stored inline.
    Fixed,
    /// Variable-length, stored as a payload handle.
    Varlen,
}

/// The shape of a table's block: one [`ColumnKind`] per user column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockLayout {
    kinds: Vec<ColumnKind>,
}

impl BlockLayout {
    #[must_use]
    pub fn new(kinds: Vec<ColumnKind>) -> Self {
        Self { kinds }
    }

    /// Total number of columns, including the reserved version-pointer
    /// column.
    #[inline]
    #[must_use]
    pub fn num_columns(&self) -> u16 {
        self.kinds.len() as u16 + NUM_RESERVED_COLUMNS
    }

    #[inline]
    #[must_use]
    pub fn num_user_columns(&self) -> usize {
        self.kinds.len()
    }

    /// Position of `column` within the user-column region, or `None` for
    /// reserved or out-of-range ids.
    #[inline]
    #[must_use]
    pub fn user_index(&self, column: ColumnId) -> Option<usize> {
        let idx = column.get().checked_sub(NUM_RESERVED_COLUMNS)? as usize;
        (idx < self.kinds.len()).then_some(idx)
    }

    #[inline]
    #[must_use]
    pub fn kind(&self, column: ColumnId) -> Option<ColumnKind> {
        self.user_index(column).map(|i| self.kinds[i])
    }

    /// Whether `column` is a variable-length user column. Reserved columns
    /// are never varlen.
    #[inline]
    #[must_use]
    pub fn is_varlen(&self, column: ColumnId) -> bool {
        self.kind(column) == Some(ColumnKind::Varlen)
    }

    /// Iterate over the user columns in layout order.
    pub fn user_columns(&self) -> impl Iterator<Item = ColumnId> + '_ {
        (0..self.kinds.len()).map(|i| ColumnId::new(i as u16 + NUM_RESERVED_COLUMNS))
    }

    /// Whether `cell` is storable in `column`. Nulls fit any column.
    #[must_use]
    pub fn accepts(&self, column: ColumnId, cell: Option<&ColumnValue>) -> bool {
        let Some(kind) = self.kind(column) else {
            return false;
        };
        match cell {
            None => true,
            Some(ColumnValue::Fixed(_)) => kind == ColumnKind::Fixed,
            Some(ColumnValue::Varlen(_)) => kind == ColumnKind::Varlen,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::value::VarlenEntry;
    use basalt_types::VERSION_POINTER_COLUMN;

    fn layout() -> BlockLayout {
        BlockLayout::new(vec![ColumnKind::Fixed, ColumnKind::Varlen, ColumnKind::Fixed])
    }

    #[test]
    fn reserved_column_is_not_user_addressable() {
        let l = layout();
        assert_eq!(l.num_columns(), 4);
        assert_eq!(l.user_index(VERSION_POINTER_COLUMN), None);
        assert!(!l.is_varlen(VERSION_POINTER_COLUMN));
    }

    #[test]
    fn varlen_detection() {
        let l = layout();
        assert!(!l.is_varlen(ColumnId::new(1)));
        assert!(l.is_varlen(ColumnId::new(2)));
        assert!(!l.is_varlen(ColumnId::new(3)));
        assert!(!l.is_varlen(ColumnId::new(4)));
    }

    #[test]
    fn user_columns_enumerate_in_order() {
        let cols: Vec<_> = layout().user_columns().collect();
        assert_eq!(
            cols,
            vec![ColumnId::new(1), ColumnId::new(2), ColumnId::new(3)]
        );
    }

    #[test]
    fn accepts_checks_kinds() {
        let l = layout();
        assert!(l.accepts(ColumnId::new(1), Some(&ColumnValue::Fixed(1))));
        assert!(!l.accepts(
            ColumnId::new(1),
            Some(&ColumnValue::Varlen(VarlenEntry::from_slice(b"x")))
        ));
        assert!(l.accepts(
            ColumnId::new(2),
            Some(&ColumnValue::Varlen(VarlenEntry::from_slice(b"x")))
        ));
        assert!(l.accepts(ColumnId::new(2), None));
        assert!(!l.accepts(ColumnId::new(9), None));
    }
}
