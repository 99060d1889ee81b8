//! End-to-end scenarios exercising `Query` through its public surface,
//! plus property tests for the sort/dedup invariants the read pipeline
//! depends on.

use std::sync::{mpsc, Arc, Mutex, Once};

use proptest::prelude::*;
use tiledb_common::datatype::Datatype;
use tiledb_common::layout::{Layout, Mode, TileOrder};
use tiledb_common::schema::{Attribute, Dimension, Domain, Schema, COORDS_NAME};

use crate::buffers::AttributeBuffer;
use crate::config::Config;
use crate::query::Query;
use crate::sparse_read::{dedup_coords, sort_coords, OverlappingCoords};
use crate::status::Status;
use crate::storage::{MemoryStorageManager, StorageManager};

static TRACING_INIT: Once = Once::new();

/// Emits the query pipeline's `tracing` spans to the test harness's
/// captured output instead of discarding them, the same way the teacher's
/// integration tests surface logs on failure.
fn init_tracing() {
    TRACING_INIT.call_once(|| {
        tracing_subscriber::fmt()
            .with_test_writer()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .try_init()
            .ok();
    });
}

fn dense_schema_4x4() -> Arc<Schema> {
    let domain = Domain::new(vec![
        Dimension::new("rows", [1, 4], 2).unwrap(),
        Dimension::new("cols", [1, 4], 2).unwrap(),
    ])
    .unwrap();
    Arc::new(
        Schema::new(
            domain,
            vec![Attribute::new("a1", Datatype::Int32)],
            TileOrder::RowMajor,
            TileOrder::RowMajor,
            false,
        )
        .unwrap(),
    )
}

fn two_attr_dense_schema_4x4() -> Arc<Schema> {
    let domain = Domain::new(vec![
        Dimension::new("rows", [1, 4], 2).unwrap(),
        Dimension::new("cols", [1, 4], 2).unwrap(),
    ])
    .unwrap();
    Arc::new(
        Schema::new(
            domain,
            vec![
                Attribute::new("a1", Datatype::Int32),
                Attribute::new("a2", Datatype::Int32),
            ],
            TileOrder::RowMajor,
            TileOrder::RowMajor,
            false,
        )
        .unwrap(),
    )
}

fn fixed_i32_buffer(values: &[i32]) -> AttributeBuffer {
    let mut buf = AttributeBuffer::fixed(values.len() * 4);
    for (i, v) in values.iter().enumerate() {
        buf.data[i * 4..i * 4 + 4].copy_from_slice(&v.to_le_bytes());
    }
    buf.data_size = buf.data.len();
    buf
}

fn coords_buffer(coords: &[[i64; 2]]) -> AttributeBuffer {
    let mut buf = AttributeBuffer::fixed(coords.len() * 16);
    for (i, c) in coords.iter().enumerate() {
        buf.data[i * 16..i * 16 + 8].copy_from_slice(&c[0].to_le_bytes());
        buf.data[i * 16 + 8..i * 16 + 16].copy_from_slice(&c[1].to_le_bytes());
    }
    buf.data_size = buf.data.len();
    buf
}

fn read_i32(buf: &AttributeBuffer) -> Vec<i32> {
    buf.data[..buf.data_size]
        .chunks_exact(4)
        .map(|c| i32::from_le_bytes(c.try_into().unwrap()))
        .collect()
}

#[test]
fn dense_write_then_read_in_row_and_column_major() {
    init_tracing();
    let schema = dense_schema_4x4();
    let storage = MemoryStorageManager::new();
    let full = schema.domain.full_subarray();

    // Cell values equal their row-major linear index, written in row-major
    // order to match the buffer's expected iteration order.
    let values: Vec<i32> = (0..16).collect();
    let mut write_query = Query::init(schema.clone(), storage.clone(), "arr", Mode::Write)
        .with_subarray(full.clone())
        .with_layout(Layout::RowMajor)
        .build()
        .unwrap();
    write_query.set_buffer("a1", fixed_i32_buffer(&values));
    write_query.submit().unwrap();
    assert_eq!(write_query.status(), Status::Completed);
    let fragment = write_query.written_fragment().unwrap();

    let mut row_major_read = Query::init(schema.clone(), storage.clone(), "arr", Mode::Read)
        .with_subarray(full.clone())
        .with_layout(Layout::RowMajor)
        .with_fragments(vec![fragment.clone()])
        .build()
        .unwrap();
    row_major_read.set_buffer("a1", AttributeBuffer::fixed(64));
    row_major_read.submit().unwrap();
    assert_eq!(read_i32(row_major_read_buf(&row_major_read)), values);

    let mut col_major_read = Query::init(schema, storage, "arr", Mode::Read)
        .with_subarray(full)
        .with_layout(Layout::ColumnMajor)
        .with_fragments(vec![fragment])
        .build()
        .unwrap();
    col_major_read.set_buffer("a1", AttributeBuffer::fixed(64));
    col_major_read.submit().unwrap();
    let got = read_i32(row_major_read_buf(&col_major_read));
    // Column-major over a 4x4 row-major-valued grid visits column 0 top to
    // bottom first: 0, 4, 8, 12, 1, 5, ...
    assert_eq!(got[0..4], [0, 4, 8, 12]);
}

fn row_major_read_buf(query: &Query) -> &AttributeBuffer {
    query.buffer("a1").unwrap()
}

#[test]
fn dense_write_under_a_tight_budget_still_writes_every_cell_in_order() {
    init_tracing();
    let schema = dense_schema_4x4();
    let storage = MemoryStorageManager::new();
    let full = schema.domain.full_subarray();

    // Budget of 3 cells against a 16-cell subarray forces write_dense to
    // split into multiple row-slabs instead of enumerating the subarray
    // in one pass (§4.5, §8).
    let mut config = Config::new();
    config.set("sm.memory_budget", "3");

    let values: Vec<i32> = (0..16).collect();
    let mut write_query = Query::init(schema.clone(), storage.clone(), "arr", Mode::Write)
        .with_subarray(full.clone())
        .with_layout(Layout::RowMajor)
        .with_config(config)
        .build()
        .unwrap();
    write_query.set_buffer("a1", fixed_i32_buffer(&values));
    write_query.submit().unwrap();
    assert_eq!(write_query.status(), Status::Completed);
    let fragment = write_query.written_fragment().unwrap();
    assert_eq!(fragment.tiles().iter().map(|t| t.cell_num).sum::<u64>(), 16);

    let mut read_query = Query::init(schema, storage, "arr", Mode::Read)
        .with_subarray(full)
        .with_layout(Layout::RowMajor)
        .with_fragments(vec![fragment])
        .build()
        .unwrap();
    read_query.set_buffer("a1", AttributeBuffer::fixed(64));
    read_query.submit().unwrap();
    assert_eq!(read_i32(row_major_read_buf(&read_query)), values);
}

#[test]
fn sparse_update_fragment_overrides_one_cell_of_a_dense_fragment() {
    init_tracing();
    let schema = dense_schema_4x4();
    let storage = MemoryStorageManager::new();
    let full = schema.domain.full_subarray();

    let values: Vec<i32> = (0..16).collect();
    let mut write_query = Query::init(schema.clone(), storage.clone(), "arr", Mode::Write)
        .with_subarray(full.clone())
        .with_layout(Layout::RowMajor)
        .build()
        .unwrap();
    write_query.set_buffer("a1", fixed_i32_buffer(&values));
    write_query.submit().unwrap();
    let dense_fragment = write_query.written_fragment().unwrap();

    // Overwrite cell (1, 1) -- row-major linear index 0 -- with 999.
    let mut update_query = Query::init(schema.clone(), storage.clone(), "arr", Mode::Write)
        .with_layout(Layout::Global)
        .build()
        .unwrap();
    update_query.set_buffer(COORDS_NAME, coords_buffer(&[[1, 1]]));
    update_query.set_buffer("a1", fixed_i32_buffer(&[999]));
    update_query.submit().unwrap();
    assert_eq!(update_query.status(), Status::Completed);
    let sparse_fragment = update_query.written_fragment().unwrap();
    assert!(!sparse_fragment.dense());

    let mut read_query = Query::init(schema, storage, "arr", Mode::Read)
        .with_subarray(full)
        .with_layout(Layout::RowMajor)
        .with_fragments(vec![dense_fragment, sparse_fragment])
        .build()
        .unwrap();
    read_query.set_buffer("a1", AttributeBuffer::fixed(64));
    read_query.submit().unwrap();
    assert_eq!(read_query.status(), Status::Completed);

    let got = read_i32(row_major_read_buf(&read_query));
    let mut expected: Vec<i32> = (0..16).collect();
    expected[0] = 999;
    assert_eq!(got, expected);
}

#[test]
fn most_recent_fragment_wins_on_duplicate_sparse_coordinate() {
    init_tracing();
    let schema = dense_schema_4x4();
    let storage = MemoryStorageManager::new();

    let mut first = Query::init(schema.clone(), storage.clone(), "arr", Mode::Write)
        .with_layout(Layout::Global)
        .build()
        .unwrap();
    first.set_buffer(COORDS_NAME, coords_buffer(&[[2, 2]]));
    first.set_buffer("a1", fixed_i32_buffer(&[1]));
    first.submit().unwrap();
    let frag1 = first.written_fragment().unwrap();

    let mut second = Query::init(schema.clone(), storage.clone(), "arr", Mode::Write)
        .with_layout(Layout::Global)
        .build()
        .unwrap();
    second.set_buffer(COORDS_NAME, coords_buffer(&[[2, 2]]));
    second.set_buffer("a1", fixed_i32_buffer(&[2]));
    second.submit().unwrap();
    let frag2 = second.written_fragment().unwrap();

    let mut read_query = Query::init(schema.clone(), storage, "arr", Mode::Read)
        .with_subarray(schema.domain.full_subarray())
        .with_layout(Layout::Global)
        .with_fragments(vec![frag1, frag2])
        .build()
        .unwrap();
    read_query.set_buffer(COORDS_NAME, AttributeBuffer::fixed(16));
    read_query.set_buffer("a1", AttributeBuffer::fixed(4));
    read_query.submit().unwrap();
    assert_eq!(read_query.status(), Status::Completed);
    assert_eq!(read_i32(row_major_read_buf(&read_query)), vec![2]);
}

#[test]
fn unordered_sparse_write_is_sorted_into_global_order_on_disk() {
    init_tracing();
    let schema = dense_schema_4x4();
    let storage = MemoryStorageManager::new();

    let mut write_query = Query::init(schema.clone(), storage.clone(), "arr", Mode::Write)
        .with_layout(Layout::Unordered)
        .build()
        .unwrap();
    write_query.set_buffer(COORDS_NAME, coords_buffer(&[[3, 3], [1, 1], [2, 4]]));
    write_query.set_buffer("a1", fixed_i32_buffer(&[30, 10, 20]));
    write_query.submit().unwrap();
    let fragment = write_query.written_fragment().unwrap();

    let mut read_query = Query::init(schema.clone(), storage, "arr", Mode::Read)
        .with_subarray(schema.domain.full_subarray())
        .with_layout(Layout::Global)
        .with_fragments(vec![fragment])
        .build()
        .unwrap();
    read_query.set_buffer("a1", AttributeBuffer::fixed(12));
    read_query.submit().unwrap();
    assert_eq!(read_query.status(), Status::Completed);
    // Global order is flat row-major lexicographic: (1,1) < (2,4) < (3,3).
    assert_eq!(read_i32(row_major_read_buf(&read_query)), vec![10, 20, 30]);
}

#[test]
fn sparse_write_under_a_tight_budget_still_writes_every_coordinate() {
    init_tracing();
    let schema = dense_schema_4x4();
    let storage = MemoryStorageManager::new();

    // Budget of 1 cell forces write_sparse to tile-bucket its five
    // coordinates one at a time rather than in a single pass (§4.5, §8).
    let mut config = Config::new();
    config.set("sm.memory_budget", "1");

    let mut write_query = Query::init(schema.clone(), storage.clone(), "arr", Mode::Write)
        .with_layout(Layout::Unordered)
        .with_config(config)
        .build()
        .unwrap();
    write_query.set_buffer(COORDS_NAME, coords_buffer(&[[3, 3], [1, 1], [2, 4], [4, 4], [1, 3]]));
    write_query.set_buffer("a1", fixed_i32_buffer(&[30, 10, 20, 40, 13]));
    write_query.submit().unwrap();
    assert_eq!(write_query.status(), Status::Completed);
    let fragment = write_query.written_fragment().unwrap();
    assert_eq!(fragment.tiles().iter().map(|t| t.cell_num).sum::<u64>(), 5);

    let mut read_query = Query::init(schema.clone(), storage, "arr", Mode::Read)
        .with_subarray(schema.domain.full_subarray())
        .with_layout(Layout::Global)
        .with_fragments(vec![fragment])
        .build()
        .unwrap();
    read_query.set_buffer("a1", AttributeBuffer::fixed(20));
    read_query.submit().unwrap();
    assert_eq!(read_query.status(), Status::Completed);
    // Global order is flat row-major lexicographic over (row, col).
    assert_eq!(read_i32(row_major_read_buf(&read_query)), vec![10, 13, 20, 30, 40]);
}

#[test]
fn overflowed_sparse_read_resumes_without_dropping_or_repeating_cells() {
    init_tracing();
    let schema = dense_schema_4x4();
    let storage = MemoryStorageManager::new();

    let mut write_query = Query::init(schema.clone(), storage.clone(), "arr", Mode::Write)
        .with_layout(Layout::Global)
        .build()
        .unwrap();
    write_query.set_buffer(COORDS_NAME, coords_buffer(&[[1, 1], [1, 2], [1, 3]]));
    write_query.set_buffer("a1", fixed_i32_buffer(&[10, 20, 30]));
    write_query.submit().unwrap();
    let fragment = write_query.written_fragment().unwrap();

    let mut read_query = Query::init(schema.clone(), storage, "arr", Mode::Read)
        .with_subarray(schema.domain.full_subarray())
        .with_layout(Layout::Global)
        .with_fragments(vec![fragment])
        .build()
        .unwrap();

    let mut collected = Vec::new();
    loop {
        read_query.set_buffer("a1", AttributeBuffer::fixed(4)); // room for 1 cell
        read_query.submit().unwrap();
        collected.extend(read_i32(row_major_read_buf(&read_query)));
        if read_query.status() == Status::Completed {
            break;
        }
        assert!(read_query.overflow());
    }
    read_query.finalize().unwrap();
    assert_eq!(collected, vec![10, 20, 30]);
}

fn var_schema_4x4() -> Arc<Schema> {
    let domain = Domain::new(vec![
        Dimension::new("rows", [1, 4], 2).unwrap(),
        Dimension::new("cols", [1, 4], 2).unwrap(),
    ])
    .unwrap();
    Arc::new(
        Schema::new(
            domain,
            vec![Attribute::var_sized("a2", Datatype::StringAscii)],
            TileOrder::RowMajor,
            TileOrder::RowMajor,
            false,
        )
        .unwrap(),
    )
}

fn var_buffer(values: &[&str]) -> AttributeBuffer {
    let mut data = Vec::new();
    let mut offsets = Vec::with_capacity(values.len() * 8);
    for v in values {
        offsets.extend_from_slice(&(data.len() as u64).to_le_bytes());
        data.extend_from_slice(v.as_bytes());
    }
    let data_len = data.len();
    let mut buf = AttributeBuffer::var(data_len, offsets.len());
    buf.data = data;
    buf.data_size = data_len;
    buf.offsets = Some(offsets.clone());
    buf.offsets_size = offsets.len();
    buf
}

fn read_var_strings(buf: &AttributeBuffer) -> Vec<String> {
    let offsets: Vec<u64> = buf.offsets.as_ref().unwrap()[..buf.offsets_size]
        .chunks_exact(8)
        .map(|c| u64::from_le_bytes(c.try_into().unwrap()))
        .collect();
    let data = &buf.data[..buf.data_size];
    (0..offsets.len())
        .map(|i| {
            let start = offsets[i] as usize;
            let end = if i + 1 < offsets.len() { offsets[i + 1] as usize } else { data.len() };
            String::from_utf8(data[start..end].to_vec()).unwrap()
        })
        .collect()
}

#[test]
fn variable_length_attribute_round_trips_through_a_sparse_fragment() {
    init_tracing();
    let schema = var_schema_4x4();
    let storage = MemoryStorageManager::new();

    let mut write_query = Query::init(schema.clone(), storage.clone(), "arr", Mode::Write)
        .with_layout(Layout::Global)
        .build()
        .unwrap();
    write_query.set_buffer(COORDS_NAME, coords_buffer(&[[1, 1], [1, 2], [2, 1], [2, 2]]));
    write_query.set_buffer("a2", var_buffer(&["ww", "ww", "yy", "xu"]));
    write_query.submit().unwrap();
    assert_eq!(write_query.status(), Status::Completed);
    let fragment = write_query.written_fragment().unwrap();

    let mut read_query = Query::init(schema.clone(), storage, "arr", Mode::Read)
        .with_subarray(schema.domain.full_subarray())
        .with_layout(Layout::Global)
        .with_fragments(vec![fragment])
        .build()
        .unwrap();
    read_query.set_buffer("a2", AttributeBuffer::var(64, 64));
    read_query.submit().unwrap();
    assert_eq!(read_query.status(), Status::Completed);
    let got = read_var_strings(read_query.buffer("a2").unwrap());
    assert_eq!(got, vec!["ww", "ww", "yy", "xu"]);
}

#[test]
fn async_process_names_fragment_with_worker_thread_not_submitter() {
    init_tracing();
    let schema = dense_schema_4x4();
    let storage = MemoryStorageManager::new();

    let mut write_query = Query::init(schema.clone(), storage.clone(), "arr", Mode::Write)
        .with_subarray(schema.domain.full_subarray())
        .with_layout(Layout::RowMajor)
        // A submitter-supplied placeholder: async_process must overwrite
        // this with the worker thread's own id before the fragment is
        // named, so it must not show up in the published fragment's URI.
        .with_thread_id("submitter-placeholder")
        .build()
        .unwrap();
    write_query.set_buffer("a1", fixed_i32_buffer(&(0..16).collect::<Vec<_>>()));

    let query = Arc::new(Mutex::new(write_query));
    let (tx, rx) = mpsc::channel();
    Query::async_process(
        query.clone(),
        Box::new(move |status| {
            tx.send(status).unwrap();
        }),
    )
    .unwrap();

    let status = rx.recv().unwrap();
    assert_eq!(status, Status::Completed);

    let fragment = query.lock().unwrap().written_fragment().unwrap();
    assert!(!fragment.uri().contains("submitter-placeholder"));
}

#[test]
fn write_failure_before_finalize_leaves_no_fragment_after_clear_fragments() {
    init_tracing();
    let schema = two_attr_dense_schema_4x4();
    let storage = MemoryStorageManager::new();

    // Only "a1" is attached; "a2" is missing, so the writer fails partway
    // through -- after a1's tiles are already on disk -- rather than at
    // validation time, exercising a genuine partial-write rollback.
    let mut write_query = Query::init(schema.clone(), storage.clone(), "arr", Mode::Write)
        .with_subarray(schema.domain.full_subarray())
        .with_layout(Layout::RowMajor)
        .build()
        .unwrap();
    write_query.set_buffer("a1", fixed_i32_buffer(&(0..16).collect::<Vec<_>>()));
    assert!(write_query.submit().is_err());
    assert_eq!(write_query.status(), Status::Failed);
    assert!(!storage.list("arr").unwrap().is_empty());

    write_query.clear_fragments().unwrap();
    assert!(storage.list("arr").unwrap().is_empty());
}

proptest! {
    #[test]
    fn dedup_keeps_exactly_one_cell_per_distinct_coordinate(
        coord_values in prop::collection::vec((1i64..4, 1i64..4, 0usize..5), 1..20)
    ) {
        let mut coords: Vec<OverlappingCoords> = coord_values
            .into_iter()
            .enumerate()
            .map(|(pos, (r, c, fragment_idx))| OverlappingCoords {
                fragment_idx,
                tile_idx: 0,
                pos: pos as u64,
                coords: vec![r, c],
            })
            .collect();
        let schema = dense_schema_4x4();
        sort_coords(&mut coords, &schema, Layout::Global);
        let deduped = dedup_coords(coords.clone());

        let mut distinct: Vec<Vec<i64>> = coords.iter().map(|c| c.coords.clone()).collect();
        distinct.sort();
        distinct.dedup();
        prop_assert_eq!(deduped.len(), distinct.len());

        for w in deduped.windows(2) {
            prop_assert!(schema.compare_coords(Layout::Global, &w[0].coords, &w[1].coords) != std::cmp::Ordering::Greater);
        }
    }
}
