//! Dense array read state (C4, §4.5).
//!
//! A fragment set that is entirely dense is read through this fast path
//! instead of C3: no coordinates are stored on disk, so none are
//! materialized unless the caller explicitly requested a `__coords`
//! buffer. Multiple dense fragments overlapping the same tile are merged
//! by most-recent-fragment-wins, exactly as the sparse pipeline's dedup
//! step does, by reusing its cell-range compression and buffer-copy code.

use std::collections::HashMap;
use std::sync::Arc;

use tiledb_common::layout::{Layout, TileOrder};
use tiledb_common::schema::{Schema, Subarray, COORDS_NAME};

use crate::buffers::QueryBuffers;
use crate::error::{Error, Result};
use crate::fragment::FragmentMetadata;
use crate::overlap::OverlappingTile;
use crate::sparse_read::{compute_cell_ranges, copy_cells, copy_coords, CopyResult, OverlappingCoords};
use crate::tile::TilePair;

fn cartesian_row_major(ranges: &[[i64; 2]]) -> Vec<Vec<i64>> {
    let mut out = vec![vec![]];
    for r in ranges {
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

pub(crate) fn iterate_subarray(subarray: &Subarray, order: TileOrder) -> Vec<Vec<i64>> {
    match order {
        TileOrder::RowMajor => cartesian_row_major(&subarray.ranges),
        TileOrder::ColumnMajor => {
            let reversed: Vec<[i64; 2]> = subarray.ranges.iter().rev().copied().collect();
            cartesian_row_major(&reversed)
                .into_iter()
                .map(|mut v| {
                    v.reverse();
                    v
                })
                .collect()
        }
    }
}

/// Reads a subarray from an all-dense fragment set directly into `buffers`,
/// without coordinate sort/dedup. Returns the same [`CopyResult`] shape as
/// the sparse pipeline so callers handle overflow identically regardless
/// of which path served the query.
pub fn read_dense(
    schema: &Schema,
    subarray: &Subarray,
    layout: Layout,
    overlapping: &[OverlappingTile],
    fragments: &[Arc<dyn FragmentMetadata>],
    attr_tiles: &HashMap<String, HashMap<(usize, u64), Arc<TilePair>>>,
    buffers: &mut QueryBuffers,
    resume_from: u64,
) -> Result<CopyResult> {
    if !layout.is_ordered() {
        return Err(tiledb_common::layout::LayoutError::UnorderedNotSparseWrite.into());
    }

    let mut winner: HashMap<u64, usize> = HashMap::new();
    for ot in overlapping {
        winner
            .entry(ot.tile_idx)
            .and_modify(|w| {
                if ot.fragment_idx > *w {
                    *w = ot.fragment_idx;
                }
            })
            .or_insert(ot.fragment_idx);
    }

    let order = match layout {
        Layout::RowMajor => TileOrder::RowMajor,
        Layout::ColumnMajor => TileOrder::ColumnMajor,
        Layout::Global | Layout::Unordered => schema.cell_order,
    };

    let mut coords = Vec::new();
    for point in iterate_subarray(subarray, order) {
        let tile_idx = schema.domain.tile_idx_of(&point).ok_or_else(|| {
            Error::Internal("dense read point fell outside the domain".into())
        })?;
        let fragment_idx = *winner.get(&tile_idx).ok_or_else(|| {
            Error::Consistency(format!("no dense fragment covers tile {tile_idx}"))
        })?;
        let pos = schema.domain.local_pos_in_tile(tile_idx, &point);
        let _ = &fragments[fragment_idx];
        coords.push(OverlappingCoords {
            fragment_idx,
            tile_idx,
            pos,
            coords: point,
        });
    }

    // Resuming an `Incomplete` read (§4.7 invariant 6) skips cells already
    // delivered to the caller in a prior submission, without recomputing
    // which fragment wins each cell.
    let remaining = &coords[(resume_from as usize).min(coords.len())..];
    let ranges = compute_cell_ranges(remaining);
    let result = copy_cells(schema, &ranges, remaining.len() as u64, attr_tiles, buffers)?;
    if let Some(buf) = buffers.get_mut(COORDS_NAME) {
        copy_coords(remaining, result.cells_copied, buf);
    }
    Ok(result)
}
