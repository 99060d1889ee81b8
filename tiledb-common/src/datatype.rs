use std::fmt::{Display, Formatter, Result as FmtResult};
use std::num::NonZeroU32;

/// The logical element type of an attribute or dimension.
///
/// Mirrors the subset of TileDB's datatype enumeration this core needs.
/// Only the byte size of a value is consulted by the query pipeline --
/// attribute data is moved as opaque byte slices (see `CellValNum`).
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Datatype {
    Int8,
    Int16,
    Int32,
    Int64,
    UInt8,
    UInt16,
    UInt32,
    UInt64,
    Float32,
    Float64,
    /// A single ASCII byte; variable-length string attributes use
    /// `CellValNum::Var` of this datatype.
    StringAscii,
}

impl Datatype {
    /// Size in bytes of a single value of this datatype.
    pub const fn size(&self) -> usize {
        match self {
            Datatype::Int8 | Datatype::UInt8 | Datatype::StringAscii => 1,
            Datatype::Int16 | Datatype::UInt16 => 2,
            Datatype::Int32 | Datatype::UInt32 | Datatype::Float32 => 4,
            Datatype::Int64
            | Datatype::UInt64
            | Datatype::Float64 => 8,
        }
    }
}

impl Display for Datatype {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        let s = match self {
            Datatype::Int8 => "int8",
            Datatype::Int16 => "int16",
            Datatype::Int32 => "int32",
            Datatype::Int64 => "int64",
            Datatype::UInt8 => "uint8",
            Datatype::UInt16 => "uint16",
            Datatype::UInt32 => "uint32",
            Datatype::UInt64 => "uint64",
            Datatype::Float32 => "float32",
            Datatype::Float64 => "float64",
            Datatype::StringAscii => "string_ascii",
        };
        write!(f, "{s}")
    }
}

/// The number of values per cell for an attribute or dimension.
///
/// `Fixed(1)` is the common case. Variable-sized attributes use `Var`, in
/// which case the attribute occupies two query buffers (offsets, values).
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum CellValNum {
    Fixed(NonZeroU32),
    Var,
}

impl CellValNum {
    pub fn single() -> Self {
        CellValNum::Fixed(NonZeroU32::new(1).unwrap())
    }

    pub fn is_var(&self) -> bool {
        matches!(self, CellValNum::Var)
    }

    /// Number of buffers a query must supply for an attribute with this
    /// cell structure: one for fixed, two (offsets + values) for var.
    pub fn num_buffers(&self) -> usize {
        match self {
            CellValNum::Fixed(_) => 1,
            CellValNum::Var => 2,
        }
    }
}

impl Display for CellValNum {
    fn fmt(&self, f: &mut Formatter<'_>) -> FmtResult {
        match self {
            CellValNum::Fixed(n) => write!(f, "Fixed({n})"),
            CellValNum::Var => write!(f, "Var"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sizes() {
        assert_eq!(Datatype::Int32.size(), 4);
        assert_eq!(Datatype::Float64.size(), 8);
        assert_eq!(Datatype::StringAscii.size(), 1);
    }

    #[test]
    fn cell_val_num_buffers() {
        assert_eq!(CellValNum::single().num_buffers(), 1);
        assert_eq!(CellValNum::Var.num_buffers(), 2);
    }
}
