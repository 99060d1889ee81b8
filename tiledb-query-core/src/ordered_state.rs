//! Ordered read/write state (C5, §4.6).
//!
//! One `OrderedState` type serves both directions instead of the teacher's
//! separate sorted/ordered read- and write-state types: the read side
//! partitions a subarray into budget-sized chunks so a `Query` can make
//! progress across repeated `Incomplete` submissions, and the write side
//! computes the permutation that sorts an `Unordered` sparse write's cells
//! into the schema's global order before the fragment writer (§4.1) ever
//! sees them.

use tiledb_common::schema::{Domain, Schema, Subarray};

/// Splits `subarray` into row-major chunks, each covering at most
/// `budget_cells` cells, by repeatedly bisecting the largest-range
/// dimension. Chunks are returned in the same row-major nesting order the
/// dense read path (§4.5) and global cell order share, so consuming them
/// in order produces the same cell order a single unbudgeted read would.
pub fn compute_subarrays(domain: &Domain, subarray: &Subarray, budget_cells: u64) -> Vec<Subarray> {
    if budget_cells == 0 || domain.cell_count(subarray) <= budget_cells {
        return vec![subarray.clone()];
    }

    let split_dim = subarray
        .ranges
        .iter()
        .enumerate()
        .max_by_key(|(_, r)| r[1] - r[0])
        .map(|(i, _)| i)
        .expect("subarray has at least one dimension");

    let r = subarray.ranges[split_dim];
    if r[0] == r[1] {
        // Every dimension is a single point: can't shrink further, hand
        // back the one-cell subarray even though it exceeds the budget.
        return vec![subarray.clone()];
    }
    let mid = r[0] + (r[1] - r[0]) / 2;

    let mut low = subarray.clone();
    low.ranges[split_dim] = [r[0], mid];
    let mut high = subarray.clone();
    high.ranges[split_dim] = [mid + 1, r[1]];

    let mut out = compute_subarrays(domain, &low, budget_cells);
    out.extend(compute_subarrays(domain, &high, budget_cells));
    out
}

/// The permutation that sorts `coords` into the schema's global order
/// (§4.6: `Unordered` writes are buffered and re-sorted before they reach
/// a fragment, since fragment attribute files are always stored in
/// global order).
pub fn sort_permutation(schema: &Schema, coords: &[Vec<i64>]) -> Vec<usize> {
    let mut perm: Vec<usize> = (0..coords.len()).collect();
    perm.sort_by(|&a, &b| {
        schema.compare_coords(tiledb_common::layout::Layout::Global, &coords[a], &coords[b])
    });
    perm
}

/// Applies a permutation computed by [`sort_permutation`] to any parallel
/// per-cell vector (attribute values, record indices, ...).
pub fn apply_permutation<T: Clone>(perm: &[usize], values: &[T]) -> Vec<T> {
    perm.iter().map(|&i| values[i].clone()).collect()
}

#[cfg(test)]
mod tests {
    use tiledb_common::datatype::Datatype;
    use tiledb_common::layout::TileOrder;
    use tiledb_common::schema::{Attribute, Dimension};

    use super::*;

    fn domain() -> Domain {
        Domain::new(vec![
            Dimension::new("rows", [1, 8], 2).unwrap(),
            Dimension::new("cols", [1, 8], 2).unwrap(),
        ])
        .unwrap()
    }

    #[test]
    fn chunks_respect_budget_and_cover_everything() {
        let domain = domain();
        let subarray = domain.full_subarray();
        let chunks = compute_subarrays(&domain, &subarray, 16);
        let total: u64 = chunks.iter().map(|c| domain.cell_count(c)).sum();
        assert_eq!(total, domain.cell_count(&subarray));
        assert!(chunks.iter().all(|c| domain.cell_count(c) <= 16));
    }

    #[test]
    fn single_chunk_when_under_budget() {
        let domain = domain();
        let subarray = domain.full_subarray();
        let chunks = compute_subarrays(&domain, &subarray, 1000);
        assert_eq!(chunks.len(), 1);
    }

    #[test]
    fn sort_permutation_orders_globally() {
        let schema = Schema::new(
            domain(),
            vec![Attribute::new("a1", Datatype::Int32)],
            TileOrder::RowMajor,
            TileOrder::RowMajor,
            true,
        )
        .unwrap();
        let coords = vec![vec![3, 1], vec![1, 1], vec![2, 5]];
        let perm = sort_permutation(&schema, &coords);
        let sorted = apply_permutation(&perm, &coords);
        assert_eq!(sorted, vec![vec![1, 1], vec![2, 5], vec![3, 1]]);
    }
}
