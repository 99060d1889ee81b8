//! Sparse read pipeline (C3, §4.4).
//!
//! Drives the five steps of a sparse (or dense+sparse-fragment-mix) read:
//! gather candidate coordinates from every overlapping tile (synthesizing
//! them for dense fragments' tiles), sort them into the requested layout,
//! deduplicate by most-recent-fragment-wins, compress the survivors into
//! contiguous per-tile cell ranges, then copy attribute payloads into the
//! caller's buffers with a shared overflow clamp.

use std::collections::HashMap;
use std::sync::Arc;

use tiledb_common::layout::Layout;
use tiledb_common::schema::{Schema, Subarray, COORDS_NAME};
use tracing::trace;

use crate::buffers::QueryBuffers;
use crate::error::{Error, Result};
use crate::fragment::FragmentMetadata;
use crate::overlap::OverlappingTile;
use crate::tile::TilePair;

/// One candidate cell, located by its source `(fragment, tile, position)`
/// and its materialized coordinate tuple.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OverlappingCoords {
    pub fragment_idx: usize,
    pub tile_idx: u64,
    /// The cell's row-major position within its tile -- for dense
    /// fragments this is the synthesized index into
    /// [`tiledb_common::schema::Domain::tile_cells_row_major`]; for sparse
    /// fragments it is the stored coordinate's index in the tile.
    pub pos: u64,
    pub coords: Vec<i64>,
}

/// Decodes a flat little-endian `i64` coordinate tile into per-cell tuples.
fn decode_coords_tile(bytes: &[u8], ndim: usize) -> Vec<Vec<i64>> {
    let cell_bytes = ndim * 8;
    bytes
        .chunks_exact(cell_bytes)
        .map(|cell| {
            cell.chunks_exact(8)
                .map(|c| i64::from_le_bytes(c.try_into().expect("8-byte chunk")))
                .collect()
        })
        .collect()
}

/// Step 1 (§4.4): gathers every candidate cell across `overlapping`,
/// filtering partial-overlap tiles by exact subarray containment and
/// trusting full-overlap tiles to need no per-cell check.
pub fn compute_overlapping_coords(
    schema: &Schema,
    subarray: &Subarray,
    overlapping: &[OverlappingTile],
    fragments: &[Arc<dyn FragmentMetadata>],
    coord_tiles: &HashMap<(usize, u64), Arc<TilePair>>,
) -> Result<Vec<OverlappingCoords>> {
    let ndim = schema.domain.ndim();
    let mut out = Vec::new();
    for ot in overlapping {
        let frag = &fragments[ot.fragment_idx];
        if frag.dense() {
            for (pos, coords) in schema.domain.tile_cells_row_major(ot.tile_idx).into_iter().enumerate() {
                if ot.full_overlap || subarray.contains_point(&coords) {
                    out.push(OverlappingCoords {
                        fragment_idx: ot.fragment_idx,
                        tile_idx: ot.tile_idx,
                        pos: pos as u64,
                        coords,
                    });
                }
            }
        } else {
            let pair = coord_tiles.get(&(ot.fragment_idx, ot.tile_idx)).ok_or_else(|| {
                Error::Internal(format!(
                    "missing coordinate tile for fragment {} tile {}",
                    ot.fragment_idx, ot.tile_idx
                ))
            })?;
            for (pos, coords) in decode_coords_tile(&pair.values.bytes, ndim).into_iter().enumerate() {
                if ot.full_overlap || subarray.contains_point(&coords) {
                    out.push(OverlappingCoords {
                        fragment_idx: ot.fragment_idx,
                        tile_idx: ot.tile_idx,
                        pos: pos as u64,
                        coords,
                    });
                }
            }
        }
    }
    Ok(out)
}

/// Step 2 (§4.4): sorts candidates into the query's requested layout.
pub fn sort_coords(coords: &mut [OverlappingCoords], schema: &Schema, layout: Layout) {
    trace!(cells = coords.len(), ?layout, "sorting candidate coordinates");
    coords.sort_by(|a, b| schema.compare_coords(layout, &a.coords, &b.coords));
}

/// Step 3 (§4.4, invariant "most-recent-wins"): `coords` must already be
/// sorted (so cells sharing a coordinate are adjacent); among cells with
/// identical coordinates, keeps the one written by the latest fragment,
/// breaking ties by in-tile position.
pub fn dedup_coords(sorted: Vec<OverlappingCoords>) -> Vec<OverlappingCoords> {
    let before = sorted.len();
    let mut out: Vec<OverlappingCoords> = Vec::with_capacity(sorted.len());
    for item in sorted {
        match out.last_mut() {
            Some(last) if last.coords == item.coords => {
                if (item.fragment_idx, item.pos) > (last.fragment_idx, last.pos) {
                    *last = item;
                }
            }
            _ => out.push(item),
        }
    }
    trace!(before, after = out.len(), "deduplicated overlapping cells");
    out
}

/// A contiguous run of deduped cells sourced from one fragment/tile, used
/// to batch attribute payload copies instead of copying cell-by-cell.
#[derive(Clone, Copy, Debug)]
pub struct OverlappingCellRange {
    pub fragment_idx: usize,
    pub tile_idx: u64,
    pub start_pos: u64,
    pub len: u64,
}

/// Step 4 (§4.4): compresses the deduped, sorted cell list into contiguous
/// `(fragment, tile, pos..pos+len)` ranges.
pub fn compute_cell_ranges(coords: &[OverlappingCoords]) -> Vec<OverlappingCellRange> {
    let mut out = Vec::new();
    let mut i = 0;
    while i < coords.len() {
        let start = &coords[i];
        let mut len = 1u64;
        let mut j = i + 1;
        while j < coords.len()
            && coords[j].fragment_idx == start.fragment_idx
            && coords[j].tile_idx == start.tile_idx
            && coords[j].pos == start.pos + len
        {
            len += 1;
            j += 1;
        }
        out.push(OverlappingCellRange {
            fragment_idx: start.fragment_idx,
            tile_idx: start.tile_idx,
            start_pos: start.pos,
            len,
        });
        i = j;
    }
    out
}

/// The result of a [`copy_cells`] call.
#[derive(Debug, Default)]
pub struct CopyResult {
    pub cells_copied: u64,
    /// The name of one buffer that ran out of room, if `cells_copied` is
    /// less than the number of cells requested.
    pub overflowed_attribute: Option<String>,
}

fn fixed_capacity_cells(attr_name: &str, schema: &Schema, buf: &crate::buffers::AttributeBuffer) -> Result<u64> {
    let cell_size = if attr_name == COORDS_NAME {
        schema.domain.ndim() * 8
    } else {
        schema.attribute(attr_name)?.cell_size()
    };
    Ok((buf.data.len() / cell_size) as u64)
}

/// Reads the variable-length payload of cell `pos` out of a var-sized
/// tile, using the teacher's offsets-plus-total-length convention: the
/// tile stores one `u64` start offset per cell, with the final cell's end
/// implied by `values.len()`.
fn var_cell_len(pair: &TilePair, pos: usize) -> usize {
    let offsets = &pair.offsets.as_ref().expect("var attribute has offsets tile").bytes;
    let n_cells = offsets.len() / 8;
    let start = u64::from_le_bytes(offsets[pos * 8..pos * 8 + 8].try_into().unwrap()) as usize;
    let end = if pos + 1 < n_cells {
        u64::from_le_bytes(offsets[(pos + 1) * 8..(pos + 1) * 8 + 8].try_into().unwrap()) as usize
    } else {
        pair.values.bytes.len()
    };
    end - start
}

/// Step 5 (§4.4): copies attribute payloads for `ranges` into `buffers`,
/// clamping every attached buffer to the same number of cells so a caller
/// resubmitting after `Incomplete` sees a consistent prefix across all of
/// them (§4.7 invariant 6). Returns how many cells were actually copied,
/// and which buffer (if any) was the limiting one.
pub fn copy_cells(
    schema: &Schema,
    ranges: &[OverlappingCellRange],
    total_cells: u64,
    attr_tiles: &HashMap<String, HashMap<(usize, u64), Arc<TilePair>>>,
    buffers: &mut QueryBuffers,
) -> Result<CopyResult> {
    let mut clamp = total_cells;
    let mut limiting: Option<String> = None;

    let names: Vec<String> = buffers.names().map(|s| s.to_string()).collect();
    for name in &names {
        let buf = buffers.get(name).expect("name came from buffers.names()");
        if !buf.is_var() {
            let cap = fixed_capacity_cells(name, schema, buf)?;
            if cap < clamp {
                clamp = cap;
                limiting = Some(name.clone());
            }
            continue;
        }
        let offsets_cap = (buf.offsets.as_ref().unwrap().len() / 8) as u64;
        let mut cap = offsets_cap.min(total_cells);
        if let Some(tiles) = attr_tiles.get(name) {
            let data_cap = buf.data.len();
            let mut used = 0usize;
            let mut n = 0u64;
            'ranges: for range in ranges {
                if n >= cap {
                    break;
                }
                if let Some(pair) = tiles.get(&(range.fragment_idx, range.tile_idx)) {
                    for local in 0..range.len {
                        if n >= cap {
                            break 'ranges;
                        }
                        let pos = (range.start_pos + local) as usize;
                        let len = var_cell_len(pair, pos);
                        if used + len > data_cap {
                            cap = n;
                            break 'ranges;
                        }
                        used += len;
                        n += 1;
                    }
                }
            }
        }
        if cap < clamp {
            clamp = cap;
            limiting = Some(name.clone());
        }
    }

    for name in &names {
        let tiles = attr_tiles.get(name);
        let mut cell_offset = 0u64;
        let mut var_byte_cursor = 0usize;
        let buf = buffers.get_mut(name).expect("name came from buffers.names()");
        let is_var = buf.is_var();
        let mut fixed_cell_size = 0usize;
        if !is_var {
            fixed_cell_size = if name == COORDS_NAME {
                schema.domain.ndim() * 8
            } else {
                schema.attribute(name)?.cell_size()
            };
        }
        'copy: for range in ranges {
            if cell_offset >= clamp {
                break;
            }
            let take = range.len.min(clamp - cell_offset);
            if take == 0 {
                break 'copy;
            }
            if name == COORDS_NAME {
                // Coordinates are written from the already-materialized
                // `OverlappingCoords` list by `copy_coords`, not read back
                // out of a tile -- dense fragments have no coordinates
                // tile to read from in the first place.
                cell_offset += take;
                continue;
            }
            if let Some(pair) = tiles.and_then(|t| t.get(&(range.fragment_idx, range.tile_idx))) {
                if !is_var {
                    let src_start = range.start_pos as usize * fixed_cell_size;
                    let src_end = src_start + take as usize * fixed_cell_size;
                    let dst_start = cell_offset as usize * fixed_cell_size;
                    let dst_end = dst_start + (take as usize * fixed_cell_size);
                    buf.data[dst_start..dst_end]
                        .copy_from_slice(&pair.values.bytes[src_start..src_end]);
                    buf.data_size = dst_end;
                } else {
                    for local in 0..take {
                        let pos = (range.start_pos + local) as usize;
                        let len = var_cell_len(pair, pos);
                        let offsets = &pair.offsets.as_ref().unwrap().bytes;
                        let src_start =
                            u64::from_le_bytes(offsets[pos * 8..pos * 8 + 8].try_into().unwrap()) as usize;
                        buf.data[var_byte_cursor..var_byte_cursor + len]
                            .copy_from_slice(&pair.values.bytes[src_start..src_start + len]);
                        let out_offsets = buf.offsets.as_mut().unwrap();
                        let out_pos = (cell_offset + local) as usize;
                        out_offsets[out_pos * 8..out_pos * 8 + 8]
                            .copy_from_slice(&(var_byte_cursor as u64).to_le_bytes());
                        var_byte_cursor += len;
                    }
                    buf.data_size = var_byte_cursor;
                    buf.offsets_size = (cell_offset as usize + take as usize) * 8;
                }
            }
            cell_offset += take;
        }
    }

    Ok(CopyResult {
        cells_copied: clamp,
        overflowed_attribute: if clamp < total_cells { limiting } else { None },
    })
}

/// Writes the first `clamp` deduped cells' coordinate tuples into the
/// caller's `__coords` buffer. Split out from [`copy_cells`] because
/// coordinates for dense fragments' cells are synthesized in
/// [`compute_overlapping_coords`] rather than read back out of a tile, so
/// there is no `TilePair` source to drive a byte-range copy from.
pub fn copy_coords(coords: &[OverlappingCoords], clamp: u64, buffer: &mut crate::buffers::AttributeBuffer) {
    if coords.is_empty() || clamp == 0 {
        buffer.data_size = 0;
        return;
    }
    let ndim = coords[0].coords.len();
    let cell_size = ndim * 8;
    for (i, cell) in coords.iter().take(clamp as usize).enumerate() {
        let start = i * cell_size;
        for (d, c) in cell.coords.iter().enumerate() {
            let off = start + d * 8;
            buffer.data[off..off + 8].copy_from_slice(&c.to_le_bytes());
        }
    }
    buffer.data_size = clamp as usize * cell_size;
}
