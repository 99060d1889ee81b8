use std::cmp::Ordering;

use thiserror::Error;

use crate::datatype::{CellValNum, Datatype};
use crate::layout::{Layout, TileOrder};

#[derive(Clone, Debug, Eq, Error, PartialEq)]
pub enum Error {
    #[error("Dimension '{0}' extent must be positive, found {1}")]
    NonPositiveExtent(String, i64),
    #[error("Dimension '{0}' domain is inverted: [{1}, {2}]")]
    InvertedDomain(String, i64, i64),
    #[error("Schema must have at least one dimension")]
    NoDimensions(),
    #[error("Unknown attribute '{0}'")]
    UnknownAttribute(String),
    #[error("Duplicate attribute name '{0}'")]
    DuplicateAttribute(String),
}

/// A single dimension of a schema's domain. Coordinates along every
/// dimension of a schema share one datatype (`i64` in this implementation
/// -- see `SPEC_FULL.md` §3), so only the domain bounds and tile extent
/// vary per dimension.
#[derive(Clone, Debug, PartialEq)]
pub struct Dimension {
    pub name: String,
    /// Inclusive domain bounds `[low, high]`.
    pub domain: [i64; 2],
    pub tile_extent: i64,
}

impl Dimension {
    pub fn new(
        name: impl Into<String>,
        domain: [i64; 2],
        tile_extent: i64,
    ) -> Result<Self, Error> {
        let name = name.into();
        if domain[0] > domain[1] {
            return Err(Error::InvertedDomain(name, domain[0], domain[1]));
        }
        if tile_extent <= 0 {
            return Err(Error::NonPositiveExtent(name, tile_extent));
        }
        Ok(Dimension {
            name,
            domain,
            tile_extent,
        })
    }

    /// Number of tiles along this dimension, rounding up for a domain that
    /// does not divide evenly by the tile extent.
    pub fn num_tiles(&self) -> u64 {
        let span = (self.domain[1] - self.domain[0] + 1) as u64;
        span.div_ceil(self.tile_extent as u64)
    }

    /// The inclusive coordinate bounds of the `tile_idx`'th tile along this
    /// dimension (0-based), clamped to the domain.
    pub fn tile_bounds(&self, tile_idx: u64) -> [i64; 2] {
        let low = self.domain[0] + (tile_idx as i64) * self.tile_extent;
        let high = std::cmp::min(low + self.tile_extent - 1, self.domain[1]);
        [low, high]
    }

    /// The 0-based tile index that contains `coord`, if it falls within the
    /// domain.
    pub fn tile_of(&self, coord: i64) -> Option<u64> {
        if coord < self.domain[0] || coord > self.domain[1] {
            return None;
        }
        Some(((coord - self.domain[0]) / self.tile_extent) as u64)
    }
}

/// The ordered set of dimensions defining an array's coordinate space.
#[derive(Clone, Debug, PartialEq)]
pub struct Domain {
    pub dimensions: Vec<Dimension>,
}

impl Domain {
    pub fn new(dimensions: Vec<Dimension>) -> Result<Self, Error> {
        if dimensions.is_empty() {
            return Err(Error::NoDimensions());
        }
        Ok(Domain { dimensions })
    }

    pub fn ndim(&self) -> usize {
        self.dimensions.len()
    }

    /// The full domain as a subarray covering every dimension's bounds.
    pub fn full_subarray(&self) -> Subarray {
        Subarray {
            ranges: self.dimensions.iter().map(|d| d.domain).collect(),
        }
    }

    /// The shape of the tile grid: number of tiles along each dimension.
    pub fn tile_grid_shape(&self) -> Vec<u64> {
        self.dimensions.iter().map(|d| d.num_tiles()).collect()
    }

    /// Total number of cells in a single (full) tile.
    pub fn cells_per_tile(&self) -> u64 {
        self.dimensions.iter().map(|d| d.tile_extent as u64).product()
    }

    /// Number of cells covered by `subarray` (assumed already validated
    /// against this domain).
    pub fn cell_count(&self, subarray: &Subarray) -> u64 {
        subarray
            .ranges
            .iter()
            .map(|r| (r[1] - r[0] + 1) as u64)
            .product()
    }

    /// The linear index, in row-major order over the tile grid, of the
    /// tile that contains `point`.
    pub fn tile_idx_of(&self, point: &[i64]) -> Option<u64> {
        let shape = self.tile_grid_shape();
        let mut idx = 0u64;
        for (dim, (d, c)) in self.dimensions.iter().zip(point).enumerate() {
            let t = d.tile_of(*c)?;
            idx = idx * shape[dim] + t;
        }
        Some(idx)
    }

    /// The per-dimension tile indices decomposed (row-major, most
    /// significant first) from a linear tile index.
    pub fn tile_coords(&self, tile_idx: u64) -> Vec<u64> {
        let shape = self.tile_grid_shape();
        let mut remaining = tile_idx;
        let mut out = vec![0u64; shape.len()];
        for i in (0..shape.len()).rev() {
            out[i] = remaining % shape[i];
            remaining /= shape[i];
        }
        out
    }

    /// The geometric bounds of the `tile_idx`'th tile (row-major over the
    /// tile grid), clamped to the domain.
    pub fn tile_bounds(&self, tile_idx: u64) -> Subarray {
        let tile_coords = self.tile_coords(tile_idx);
        Subarray {
            ranges: self
                .dimensions
                .iter()
                .zip(tile_coords)
                .map(|(d, t)| d.tile_bounds(t))
                .collect(),
        }
    }

    /// Total number of tiles in the full tile grid.
    pub fn num_tiles_total(&self) -> u64 {
        self.tile_grid_shape().iter().product()
    }

    /// The position of `point` within its tile, under a fixed row-major
    /// internal tile layout (last dimension fastest-varying). `point` must
    /// lie within `tile_bounds(tile_idx)`.
    pub fn local_pos_in_tile(&self, tile_idx: u64, point: &[i64]) -> u64 {
        let bounds = self.tile_bounds(tile_idx);
        let mut pos = 0u64;
        for (r, c) in bounds.ranges.iter().zip(point) {
            let extent = (r[1] - r[0] + 1) as u64;
            let local = (*c - r[0]) as u64;
            pos = pos * extent + local;
        }
        pos
    }

    /// Every coordinate tuple of the `tile_idx`'th tile, in row-major
    /// internal order (the same order `local_pos_in_tile` indexes into).
    pub fn tile_cells_row_major(&self, tile_idx: u64) -> Vec<Vec<i64>> {
        let bounds = self.tile_bounds(tile_idx);
        let mut out = vec![vec![]];
        for r in &bounds.ranges {
            let mut next = Vec::with_capacity(out.len() * (r[1] - r[0] + 1) as usize);
            for prefix in &out {
                for v in r[0]..=r[1] {
                    let mut p = prefix.clone();
                    p.push(v);
                    next.push(p);
                }
            }
            out = next;
        }
        out
    }
}

/// A hyper-rectangular selection over a domain: one inclusive `[low, high]`
/// range per dimension.
#[derive(Clone, Debug, PartialEq)]
pub struct Subarray {
    pub ranges: Vec<[i64; 2]>,
}

impl Subarray {
    pub fn new(ranges: Vec<[i64; 2]>) -> Self {
        Subarray { ranges }
    }

    pub fn ndim(&self) -> usize {
        self.ranges.len()
    }

    pub fn contains_point(&self, point: &[i64]) -> bool {
        self.ranges
            .iter()
            .zip(point)
            .all(|(r, c)| r[0] <= *c && *c <= r[1])
    }

    /// Half-open-interval containment per `SPEC_FULL.md` §4.2 step 3:
    /// `self` contains `other` iff every dimension's low bound of `self`
    /// is <= the corresponding low bound of `other`, and `other`'s high
    /// bound is <= `self`'s high bound.
    pub fn contains(&self, other: &Subarray) -> bool {
        self.ranges
            .iter()
            .zip(&other.ranges)
            .all(|(a, b)| a[0] <= b[0] && b[1] <= a[1])
    }

    /// The overlap of two subarrays, or `None` if they are disjoint on any
    /// dimension.
    pub fn intersect(&self, other: &Subarray) -> Option<Subarray> {
        let mut ranges = Vec::with_capacity(self.ranges.len());
        for (a, b) in self.ranges.iter().zip(&other.ranges) {
            let low = std::cmp::max(a[0], b[0]);
            let high = std::cmp::min(a[1], b[1]);
            if low > high {
                return None;
            }
            ranges.push([low, high]);
        }
        Some(Subarray { ranges })
    }

    pub fn is_within(&self, domain: &Domain) -> bool {
        if self.ranges.len() != domain.ndim() {
            return false;
        }
        self.ranges.iter().zip(&domain.dimensions).all(|(r, d)| {
            r[0] <= r[1] && r[0] >= d.domain[0] && r[1] <= d.domain[1]
        })
    }
}

/// A single column of the array, fixed- or variable-sized.
#[derive(Clone, Debug, PartialEq)]
pub struct Attribute {
    pub name: String,
    pub datatype: Datatype,
    pub cell_val_num: CellValNum,
    pub nullable: bool,
}

impl Attribute {
    pub fn new(name: impl Into<String>, datatype: Datatype) -> Self {
        Attribute {
            name: name.into(),
            datatype,
            cell_val_num: CellValNum::single(),
            nullable: false,
        }
    }

    pub fn var_sized(name: impl Into<String>, datatype: Datatype) -> Self {
        Attribute {
            name: name.into(),
            datatype,
            cell_val_num: CellValNum::Var,
            nullable: false,
        }
    }

    /// Byte size of one fixed-sized cell, meaningless for `Var` attributes.
    pub fn cell_size(&self) -> usize {
        match self.cell_val_num {
            CellValNum::Fixed(n) => self.datatype.size() * n.get() as usize,
            CellValNum::Var => self.datatype.size(),
        }
    }
}

/// The reserved name of the coordinates pseudo-attribute carried by sparse
/// fragments.
pub const COORDS_NAME: &str = "__coords";

/// The immutable description of an array, shared by every `Query` against
/// it.
#[derive(Clone, Debug, PartialEq)]
pub struct Schema {
    pub domain: Domain,
    pub attributes: Vec<Attribute>,
    pub cell_order: TileOrder,
    pub tile_order: TileOrder,
    pub sparse: bool,
}

impl Schema {
    pub fn new(
        domain: Domain,
        attributes: Vec<Attribute>,
        cell_order: TileOrder,
        tile_order: TileOrder,
        sparse: bool,
    ) -> Result<Self, Error> {
        let mut seen = std::collections::HashSet::new();
        for attr in &attributes {
            if !seen.insert(attr.name.clone()) {
                return Err(Error::DuplicateAttribute(attr.name.clone()));
            }
        }
        Ok(Schema {
            domain,
            attributes,
            cell_order,
            tile_order,
            sparse,
        })
    }

    pub fn attribute(&self, name: &str) -> Result<&Attribute, Error> {
        self.attributes
            .iter()
            .find(|a| a.name == name)
            .ok_or_else(|| Error::UnknownAttribute(name.to_string()))
    }

    pub fn attribute_id(&self, name: &str) -> Result<usize, Error> {
        self.attributes
            .iter()
            .position(|a| a.name == name)
            .ok_or_else(|| Error::UnknownAttribute(name.to_string()))
    }

    /// Compares two coordinate tuples under the given layout.
    ///
    /// `Layout::Global` uses the schema's own cell order. Tile-order
    /// blocking of global order is intentionally not modeled: this
    /// implementation's global order is a flat application of the cell
    /// order comparator across dimensions, matching the expected output of
    /// this core's multi-fragment sparse scenarios (see `DESIGN.md`).
    pub fn compare_coords(&self, layout: Layout, a: &[i64], b: &[i64]) -> Ordering {
        let order = match layout {
            Layout::RowMajor => TileOrder::RowMajor,
            Layout::ColumnMajor => TileOrder::ColumnMajor,
            Layout::Global => self.cell_order,
            Layout::Unordered => self.cell_order,
        };
        match order {
            TileOrder::RowMajor => a.cmp(b),
            TileOrder::ColumnMajor => {
                a.iter().rev().cmp(b.iter().rev())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dim(name: &str) -> Dimension {
        Dimension::new(name, [1, 4], 2).unwrap()
    }

    fn domain() -> Domain {
        Domain::new(vec![dim("rows"), dim("cols")]).unwrap()
    }

    #[test]
    fn tile_grid_shape_2x2() {
        assert_eq!(domain().tile_grid_shape(), vec![2, 2]);
    }

    #[test]
    fn tile_of_and_bounds() {
        let d = dim("rows");
        assert_eq!(d.tile_of(1), Some(0));
        assert_eq!(d.tile_of(2), Some(0));
        assert_eq!(d.tile_of(3), Some(1));
        assert_eq!(d.tile_bounds(1), [3, 4]);
    }

    #[test]
    fn subarray_contains_half_open() {
        let outer = Subarray::new(vec![[1, 4], [1, 4]]);
        let inner = Subarray::new(vec![[1, 2], [1, 2]]);
        assert!(outer.contains(&inner));
        assert!(!inner.contains(&outer));
    }

    #[test]
    fn row_major_is_plain_lexicographic() {
        let schema = Schema::new(
            domain(),
            vec![Attribute::new("a1", Datatype::Int32)],
            TileOrder::RowMajor,
            TileOrder::RowMajor,
            true,
        )
        .unwrap();
        assert_eq!(
            schema.compare_coords(Layout::Global, &[3, 1], &[3, 3]),
            Ordering::Less
        );
        assert_eq!(
            schema.compare_coords(Layout::Global, &[4, 2], &[3, 4]),
            Ordering::Greater
        );
    }
}
