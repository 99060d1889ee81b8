use thiserror::Error;

/// The query type: whether a `Query` reads from or writes to an array.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Mode {
    Read,
    Write,
}

/// The tile grid traversal order for a dense array's tile grid.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TileOrder {
    RowMajor,
    ColumnMajor,
}

/// The cell order requested of (or produced by) a `Query`.
///
/// `Global` is the schema's native on-disk order (tile order, then cell
/// order within a tile). `Unordered` is only legal for sparse writes: the
/// fragment writer is responsible for sorting cells into `Global` order
/// before they hit the fragment's attribute files.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum Layout {
    RowMajor,
    ColumnMajor,
    Global,
    Unordered,
}

impl Layout {
    pub fn is_ordered(&self) -> bool {
        !matches!(self, Layout::Unordered)
    }
}

#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum LayoutError {
    #[error("Unordered layout is only valid for sparse writes")]
    UnorderedNotSparseWrite,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unordered_is_not_ordered() {
        assert!(!Layout::Unordered.is_ordered());
        assert!(Layout::RowMajor.is_ordered());
        assert!(Layout::Global.is_ordered());
    }
}
