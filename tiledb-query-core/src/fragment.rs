//! Fragment identity and metadata (§3, §6).
//!
//! A `Fragment` is an immutable, URI-addressed append unit. Its metadata --
//! covered subdomain, per-tile MBRs or grid, per-tile byte ranges, cell
//! counts -- is an external collaborator the query core only reads through
//! the [`FragmentMetadata`] trait; [`FragmentMetadataImpl`] is the concrete
//! in-process bookkeeping object the fragment writer builds and the read
//! pipeline consults.

use std::collections::HashMap;
use std::fmt;
use std::time::{SystemTime, UNIX_EPOCH};

use tiledb_common::schema::Subarray;

use crate::error::{Error, Result};

/// Per-tile summary consulted by the overlap computer (C2) and tile
/// reader (C1).
#[derive(Clone, Debug)]
pub struct TileSummary {
    pub tile_idx: u64,
    /// For dense fragments, the tile's full geometric bounds. For sparse
    /// fragments, the minimum bounding rectangle of the coordinates
    /// actually stored in the tile.
    pub mbr: Subarray,
    pub cell_num: u64,
}

/// The byte range of one attribute's payload for one tile.
#[derive(Clone, Copy, Debug)]
pub struct AttrRange {
    /// `(offset, length)` of the values file payload.
    pub values: (u64, u64),
    /// `(offset, length)` of the offsets file payload, present only for
    /// variable-sized attributes.
    pub offsets: Option<(u64, u64)>,
}

/// The read-side contract a `Query` consumes for each fragment involved in
/// a query. Implemented by [`FragmentMetadataImpl`]; kept as a trait so
/// the pipeline does not care whether metadata was just built in-process
/// by a write, or loaded back from a `StorageManager`.
pub trait FragmentMetadata: fmt::Debug + Send + Sync {
    fn uri(&self) -> &str;
    fn timestamp(&self) -> u128;
    /// `true` if this fragment stores explicit coordinates (a sparse
    /// *fragment* -- see `SPEC_FULL.md` §9: a dense array may still
    /// accumulate sparse update fragments).
    fn dense(&self) -> bool;
    /// The subdomain this fragment covers.
    fn domain(&self) -> &Subarray;
    /// Tiles, sorted ascending by `tile_idx`.
    fn tiles(&self) -> &[TileSummary];
    fn attr_range(&self, tile_idx: u64, attr_name: &str) -> Result<AttrRange>;
}

/// In-process fragment metadata, built by the fragment writer (§4.6) and
/// consulted by the read pipeline (§4.2-§4.5).
#[derive(Clone, Debug)]
pub struct FragmentMetadataImpl {
    uri: String,
    timestamp: u128,
    dense: bool,
    domain: Subarray,
    tiles: Vec<TileSummary>,
    /// `(tile_idx, attr_name) -> AttrRange`
    attr_ranges: HashMap<(u64, String), AttrRange>,
}

impl FragmentMetadataImpl {
    /// The full tile/attribute byte-range table, for callers (the
    /// fragment writer's publish step) that need to carry it over into a
    /// republished copy rather than look up one entry at a time.
    pub fn attr_ranges(&self) -> &HashMap<(u64, String), AttrRange> {
        &self.attr_ranges
    }

    pub fn new(
        uri: String,
        timestamp: u128,
        dense: bool,
        domain: Subarray,
        tiles: Vec<TileSummary>,
        attr_ranges: HashMap<(u64, String), AttrRange>,
    ) -> Self {
        FragmentMetadataImpl {
            uri,
            timestamp,
            dense,
            domain,
            tiles,
            attr_ranges,
        }
    }
}

impl FragmentMetadata for FragmentMetadataImpl {
    fn uri(&self) -> &str {
        &self.uri
    }

    fn timestamp(&self) -> u128 {
        self.timestamp
    }

    fn dense(&self) -> bool {
        self.dense
    }

    fn domain(&self) -> &Subarray {
        &self.domain
    }

    fn tiles(&self) -> &[TileSummary] {
        &self.tiles
    }

    fn attr_range(&self, tile_idx: u64, attr_name: &str) -> Result<AttrRange> {
        self.attr_ranges
            .get(&(tile_idx, attr_name.to_string()))
            .copied()
            .ok_or_else(|| {
                Error::Consistency(format!(
                    "no byte range recorded for attribute '{attr_name}' tile {tile_idx} of fragment {}",
                    self.uri
                ))
            })
    }
}

/// The current time in milliseconds since the Unix epoch, used for
/// fragment naming (§4.1) and fragment ordering (§3 invariant).
pub fn now_millis() -> u128 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .expect("system clock before epoch")
        .as_millis()
}

/// The in-progress name of a new fragment: `.__<thread-id>_<ms-timestamp>`.
/// The leading `.` marks it invisible to readers until `finalize()`
/// renames it away (§4.1, §6).
pub fn new_fragment_name(array_uri: &str, thread_id: &str, timestamp_ms: u128) -> String {
    format!("{array_uri}/.__{thread_id}_{timestamp_ms}")
}

/// The published name: the in-progress name with its leading `.` stripped.
/// `finalize()`'s rename from in-progress to published name is the atomic
/// publication point of a write fragment.
pub fn published_name(in_progress_name: &str) -> String {
    match in_progress_name.rsplit_once('/') {
        Some((dir, base)) => {
            format!("{dir}/{}", base.trim_start_matches('.'))
        }
        None => in_progress_name.trim_start_matches('.').to_string(),
    }
}
