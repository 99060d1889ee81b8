//! Tile cache / reader (C1, §4.3).
//!
//! Tiles are loaded through the [`StorageManager`] boundary and shared
//! (`Arc`) between the pipeline stages that consult them; the last
//! releaser frees the backing bytes. Decompression would happen here per
//! the attribute's codec -- this implementation carries only a passthrough
//! codec (§1: tile-level compression is out of scope), so `Tile::bytes` is
//! exactly what the storage manager returned.

use std::collections::HashMap;
use std::sync::Arc;

use tiledb_common::schema::COORDS_NAME;

use crate::error::Result;
use crate::fragment::FragmentMetadata;
use crate::overlap::OverlappingTile;
use crate::storage::StorageManager;

/// One tile's worth of bytes for one attribute file.
#[derive(Debug)]
pub struct Tile {
    pub bytes: Vec<u8>,
}

/// The offsets tile (present only for variable-sized attributes) paired
/// with the values tile. Coordinates are served through this same type
/// under the reserved `__coords` name, with `offsets` always `None`.
#[derive(Debug)]
pub struct TilePair {
    pub offsets: Option<Arc<Tile>>,
    pub values: Arc<Tile>,
}

fn values_uri(fragment_uri: &str, attr_name: &str) -> String {
    format!("{fragment_uri}/{attr_name}.tdb")
}

fn offsets_uri(fragment_uri: &str, attr_name: &str) -> String {
    format!("{fragment_uri}/{attr_name}_var.tdb")
}

pub fn coords_file_name() -> &'static str {
    "__coords"
}

/// Loads and caches tiles for one attribute across a set of overlapping
/// tiles, keyed by `(fragment_idx, tile_idx)`.
pub struct TileReader<'a> {
    storage: &'a dyn StorageManager,
}

impl<'a> TileReader<'a> {
    pub fn new(storage: &'a dyn StorageManager) -> Self {
        TileReader { storage }
    }

    /// Materializes tiles for `attr_name` across every tile in
    /// `overlapping`, for dense fragments' synthesized reads this is
    /// skipped by the caller (dense fragments carry no `__coords` file).
    pub fn read_tiles(
        &self,
        attr_name: &str,
        overlapping: &[OverlappingTile],
        fragments: &[Arc<dyn FragmentMetadata>],
    ) -> Result<HashMap<(usize, u64), Arc<TilePair>>> {
        let mut out = HashMap::new();
        for ot in overlapping {
            let key = (ot.fragment_idx, ot.tile_idx);
            if out.contains_key(&key) {
                continue;
            }
            let frag = &fragments[ot.fragment_idx];
            if attr_name == COORDS_NAME && frag.dense() {
                // Dense fragments carry no coordinates file; the caller
                // (sparse_read::compute_overlapping_coords) synthesizes
                // coordinates for dense tiles instead of reading one.
                continue;
            }
            let range = frag.attr_range(ot.tile_idx, attr_name)?;
            let values = Arc::new(Tile {
                bytes: self.storage.read(
                    &values_uri(frag.uri(), attr_name),
                    range.values.0,
                    range.values.1,
                )?,
            });
            let offsets = match range.offsets {
                Some((off, len)) => Some(Arc::new(Tile {
                    bytes: self.storage.read(
                        &offsets_uri(frag.uri(), attr_name),
                        off,
                        len,
                    )?,
                })),
                None => None,
            };
            out.insert(key, Arc::new(TilePair { offsets, values }));
        }
        Ok(out)
    }
}
