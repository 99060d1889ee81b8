//! Overlap computer (C2, §4.2).

use std::sync::Arc;

use tiledb_common::schema::Subarray;
use tracing::trace;

use crate::fragment::FragmentMetadata;

/// A candidate `(fragment, tile)` pair selected by [`compute_overlapping_tiles`].
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct OverlappingTile {
    pub fragment_idx: usize,
    pub tile_idx: u64,
    /// `true` iff the tile's MBR (sparse) or geometric bounds (dense) lies
    /// entirely within the query subarray.
    pub full_overlap: bool,
}

/// Enumerates every `(fragment, tile)` pair whose tile intersects
/// `subarray`, across all `fragments` (assumed ordered by ascending
/// creation time). Output is ordered `(fragment_idx, tile_idx)` ascending,
/// giving a deterministic tie-break basis for dedup (§4.4 step 5).
///
/// The dense and sparse cases share one algorithm: dense fragments report
/// one [`crate::fragment::TileSummary`] per schema tile grid cell with the
/// tile's full geometric bounds as its MBR; sparse fragments report only
/// non-empty tiles with the MBR of their actually-stored coordinates.
/// Containment uses half-open intervals per dimension, per §4.2 step 3.
pub fn compute_overlapping_tiles(
    subarray: &Subarray,
    fragments: &[Arc<dyn FragmentMetadata>],
) -> Vec<OverlappingTile> {
    let mut out = Vec::new();
    for (fragment_idx, frag) in fragments.iter().enumerate() {
        let Some(isect) = subarray.intersect(frag.domain()) else {
            continue;
        };
        for tile in frag.tiles() {
            if isect.intersect(&tile.mbr).is_some() {
                let full_overlap = subarray.contains(&tile.mbr);
                trace!(
                    fragment_idx,
                    tile_idx = tile.tile_idx,
                    full_overlap,
                    "tile overlaps subarray"
                );
                out.push(OverlappingTile {
                    fragment_idx,
                    tile_idx: tile.tile_idx,
                    full_overlap,
                });
            }
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use tiledb_common::schema::{Dimension, Domain};

    use super::*;
    use crate::fragment::{AttrRange, FragmentMetadataImpl, TileSummary};

    fn domain() -> Domain {
        Domain::new(vec![
            Dimension::new("rows", [1, 4], 2).unwrap(),
            Dimension::new("cols", [1, 4], 2).unwrap(),
        ])
        .unwrap()
    }

    fn dense_fragment(uri: &str, ts: u128, domain: &Domain) -> Arc<dyn FragmentMetadata> {
        let tiles = (0..domain.num_tiles_total())
            .map(|t| TileSummary {
                tile_idx: t,
                mbr: domain.tile_bounds(t),
                cell_num: domain.cells_per_tile(),
            })
            .collect();
        Arc::new(FragmentMetadataImpl::new(
            uri.to_string(),
            ts,
            true,
            domain.full_subarray(),
            tiles,
            HashMap::new(),
        ))
    }

    #[test]
    fn dense_full_domain_gives_all_four_tiles() {
        let domain = domain();
        let frags = vec![dense_fragment("f0", 1, &domain)];
        let overlapping =
            compute_overlapping_tiles(&domain.full_subarray(), &frags);
        assert_eq!(overlapping.len(), 4);
        assert!(overlapping.iter().all(|o| o.full_overlap));
    }

    #[test]
    fn partial_subarray_marks_partial_overlap() {
        let domain = domain();
        let frags = vec![dense_fragment("f0", 1, &domain)];
        let sub = Subarray::new(vec![[2, 3], [2, 3]]);
        let overlapping = compute_overlapping_tiles(&sub, &frags);
        // all four tiles intersect [2,3]x[2,3], none is fully contained
        assert_eq!(overlapping.len(), 4);
        assert!(overlapping.iter().all(|o| !o.full_overlap));
    }

    #[test]
    fn attr_range_lookup_roundtrips() {
        let domain = domain();
        let mut ranges = HashMap::new();
        ranges.insert(
            (0u64, "a1".to_string()),
            AttrRange {
                values: (0, 16),
                offsets: None,
            },
        );
        let frag = FragmentMetadataImpl::new(
            "f0".to_string(),
            1,
            true,
            domain.full_subarray(),
            vec![],
            ranges,
        );
        let range = frag.attr_range(0, "a1").unwrap();
        assert_eq!(range.values, (0, 16));
    }
}
