//! Query controller (C6, §4.7).
//!
//! Owns the lifecycle state machine (`Uninitialized -> InProgress ->
//! {Completed | Incomplete | Failed}`), dispatches a `submit()` to the
//! dense fast path (C4) or the sparse pipeline (C3), and exposes the
//! overflow-driven resubmission protocol callers use to drain a query
//! that returned `Incomplete`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tiledb_common::layout::{Layout, LayoutError, Mode};
use tiledb_common::schema::{Schema, Subarray, COORDS_NAME};
use tracing::{info, instrument, warn};

use crate::array_read_state::read_dense;
use crate::buffers::{AttributeBuffer, QueryBuffers};
use crate::callback::QueryCallback;
use crate::config::Config;
use crate::error::{Error, Result};
use crate::fragment::{now_millis, FragmentMetadata};
use crate::fragment_writer::FragmentWriter;
use crate::ordered_state::compute_subarrays;
use crate::overlap::compute_overlapping_tiles;
use crate::sparse_read::{compute_cell_ranges, compute_overlapping_coords, copy_cells, copy_coords, dedup_coords, sort_coords};
use crate::status::{AtomicStatus, Status};
use crate::storage::StorageManager;
use crate::tile::TileReader;

/// Builder for [`Query`], following the same `XBuilder::new().with_foo().
/// build()` shape the rest of this crate family uses.
pub struct QueryBuilder {
    schema: Arc<Schema>,
    storage: Arc<dyn StorageManager>,
    array_uri: String,
    mode: Mode,
    subarray: Option<Subarray>,
    layout: Layout,
    config: Config,
    fragments: Vec<Arc<dyn FragmentMetadata>>,
    thread_id: String,
}

impl QueryBuilder {
    pub fn new(schema: Arc<Schema>, storage: Arc<dyn StorageManager>, array_uri: impl Into<String>, mode: Mode) -> Self {
        QueryBuilder {
            schema,
            storage,
            array_uri: array_uri.into(),
            mode,
            subarray: None,
            layout: Layout::Global,
            config: Config::new(),
            fragments: Vec::new(),
            thread_id: "0".to_string(),
        }
    }

    pub fn with_subarray(mut self, subarray: Subarray) -> Self {
        self.subarray = Some(subarray);
        self
    }

    pub fn with_layout(mut self, layout: Layout) -> Self {
        self.layout = layout;
        self
    }

    pub fn with_config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// The fragments visible to a read, ordered ascending by creation time
    /// -- the last entry is treated as most recent for conflict
    /// resolution (§4.4 step 3, §4.5).
    pub fn with_fragments(mut self, fragments: Vec<Arc<dyn FragmentMetadata>>) -> Self {
        self.fragments = fragments;
        self
    }

    pub fn with_thread_id(mut self, thread_id: impl Into<String>) -> Self {
        self.thread_id = thread_id.into();
        self
    }

    pub fn build(self) -> Result<Query> {
        if let Some(ref subarray) = self.subarray {
            if !subarray.is_within(&self.schema.domain) {
                return Err(Error::Subarray(
                    "subarray is not within the schema's domain".into(),
                ));
            }
        }
        if matches!(self.layout, Layout::Unordered) && self.mode != Mode::Write {
            return Err(LayoutError::UnorderedNotSparseWrite.into());
        }
        Ok(Query {
            schema: self.schema,
            storage: self.storage,
            array_uri: self.array_uri,
            mode: self.mode,
            subarray: self.subarray,
            layout: self.layout,
            config: self.config,
            fragments: self.fragments,
            thread_id: self.thread_id,
            buffers: QueryBuffers::new(),
            status: AtomicStatus::new(Status::Uninitialized),
            last_overflow: None,
            written_fragment: None,
            pending_fragment_uri: None,
            read_progress: 0,
            chunk_idx: 0,
        })
    }
}

/// A single query against an array: either a read over a set of fragments,
/// or a write that produces one new fragment.
pub struct Query {
    schema: Arc<Schema>,
    storage: Arc<dyn StorageManager>,
    array_uri: String,
    mode: Mode,
    subarray: Option<Subarray>,
    layout: Layout,
    config: Config,
    fragments: Vec<Arc<dyn FragmentMetadata>>,
    thread_id: String,
    buffers: QueryBuffers,
    status: AtomicStatus,
    last_overflow: Option<String>,
    written_fragment: Option<Arc<dyn FragmentMetadata>>,
    /// The in-progress (dot-prefixed) URI of a fragment this write has
    /// started building but not yet published via `finalize()`. Cleared
    /// once `finalize()` succeeds; left set if the write fails partway,
    /// so `clear_fragments()` knows what to unlink (§4.1, §8 S6).
    pending_fragment_uri: Option<String>,
    /// Cells already delivered to the caller out of the current chunk,
    /// across prior submissions of this same query, for resuming after
    /// `Incomplete` (§4.7 invariant 6).
    read_progress: u64,
    /// Which budget-sized partition of the subarray (§4.6,
    /// `ordered_state::compute_subarrays`) the next `submit()` continues
    /// from.
    chunk_idx: usize,
}

impl Query {
    /// Entry point matching the teacher's builder convention: `Query::init
    /// (...).with_subarray(...).build()?`.
    pub fn init(schema: Arc<Schema>, storage: Arc<dyn StorageManager>, array_uri: impl Into<String>, mode: Mode) -> QueryBuilder {
        QueryBuilder::new(schema, storage, array_uri, mode)
    }

    pub fn set_buffer(&mut self, name: impl Into<String>, buffer: AttributeBuffer) {
        self.buffers.set(name, buffer);
    }

    pub fn status(&self) -> Status {
        self.status.load()
    }

    /// `true` once `submit()` has left at least one attached buffer
    /// undrained (§4.7 invariant 6).
    pub fn overflow(&self) -> bool {
        self.status() == Status::Incomplete
    }

    pub fn overflow_attribute(&self, attr_id: usize) -> bool {
        self.last_overflow
            .as_deref()
            .and_then(|name| self.buffers.buffer_index(name))
            == Some(attr_id)
    }

    pub fn overflow_named(&self, name: &str) -> bool {
        self.last_overflow.as_deref() == Some(name)
    }

    /// Rollback (§4.1, §8 S6): finalizes the query -- which, for a
    /// `Failed` write, unlinks any fragment it started but never
    /// published -- and drops the borrowed read fragment list.
    /// Idempotent: calling it again once the in-progress fragment has
    /// already been removed is a no-op.
    pub fn clear_fragments(&mut self) -> Result<()> {
        self.finalize()?;
        self.fragments.clear();
        Ok(())
    }

    pub fn written_fragment(&self) -> Option<Arc<dyn FragmentMetadata>> {
        self.written_fragment.clone()
    }

    /// The current contents of an attached buffer, for callers reading
    /// results back out after `submit()`.
    pub fn buffer(&self, name: &str) -> Option<&AttributeBuffer> {
        self.buffers.get(name)
    }

    /// Drives one submission of the query to completion or a recoverable
    /// `Incomplete`. Every other error kind is terminal: the query moves
    /// to `Failed` and the caller must still call [`Query::finalize`].
    #[instrument(skip(self), fields(array = %self.array_uri, mode = ?self.mode))]
    pub fn submit(&mut self) -> Result<()> {
        if self.status.load().is_terminal() {
            return Err(Error::Internal(
                "query already reached a terminal status; re-init to submit again".into(),
            ));
        }
        self.status.store(Status::InProgress);
        self.last_overflow = None;

        let outcome = match self.mode {
            Mode::Read => self.submit_read(),
            Mode::Write => self.submit_write(),
        };

        match outcome {
            Ok(Status::Incomplete) => {
                warn!(attribute = ?self.last_overflow, "query incomplete: buffer overflow");
                self.status.store(Status::Incomplete);
                Ok(())
            }
            Ok(_) => {
                info!("query completed");
                self.status.store(Status::Completed);
                Ok(())
            }
            Err(e) => {
                self.status.store(Status::Failed);
                Err(e)
            }
        }
    }

    /// Submits the query on a `StorageManager`-provided background
    /// thread, invoking `callback` once a terminal or `Incomplete` status
    /// is reached. Takes `Arc<Mutex<Query>>` rather than `&mut self`
    /// because the callback fires from another thread.
    ///
    /// Fragment naming is deferred to this point (§4.1): the thread id
    /// baked into `QueryBuilder::with_thread_id` is only a placeholder
    /// for a synchronous `submit()`. Here, before the query actually
    /// runs, it is overwritten with the id of the worker thread that is
    /// about to execute it, so a write's fragment is named by the thread
    /// that actually builds it rather than the one that called
    /// `async_process`.
    pub fn async_process(query: Arc<Mutex<Query>>, callback: Box<dyn QueryCallback>) -> Result<()> {
        let storage = query.lock().expect("query mutex poisoned").storage.clone();
        storage.submit_async(Box::new(move || {
            let status = {
                let mut q = query.lock().expect("query mutex poisoned");
                q.thread_id = executing_thread_id();
                match q.submit() {
                    Ok(()) => q.status(),
                    Err(_) => Status::Failed,
                }
            };
            callback.on_done(status);
        }))
    }

    fn submit_read(&mut self) -> Result<Status> {
        self.buffers.validate(&self.schema)?;
        let subarray = self
            .subarray
            .clone()
            .unwrap_or_else(|| self.schema.domain.full_subarray());
        let budget = self.config.memory_budget_cells()?;
        let chunks = compute_subarrays(&self.schema.domain, &subarray, budget);
        if self.chunk_idx >= chunks.len() {
            return Ok(Status::Completed);
        }
        let chunk = chunks[self.chunk_idx].clone();

        let overlapping = compute_overlapping_tiles(&chunk, &self.fragments);
        let all_dense = self.fragments.iter().all(|f| f.dense());
        let reader = TileReader::new(self.storage.as_ref());

        let requested: Vec<String> = self.buffers.names().map(|s| s.to_string()).collect();
        let mut attr_tiles = HashMap::new();
        for name in &requested {
            if name == COORDS_NAME {
                continue;
            }
            attr_tiles.insert(name.clone(), reader.read_tiles(name, &overlapping, &self.fragments)?);
        }

        let (result, total_cells) = if all_dense {
            let total_cells = self.schema.domain.cell_count(&chunk);
            let result = read_dense(
                &self.schema,
                &chunk,
                self.layout,
                &overlapping,
                &self.fragments,
                &attr_tiles,
                &mut self.buffers,
                self.read_progress,
            )?;
            (result, total_cells)
        } else {
            let coord_tiles = reader.read_tiles(COORDS_NAME, &overlapping, &self.fragments)?;
            let mut coords = compute_overlapping_coords(
                &self.schema,
                &chunk,
                &overlapping,
                &self.fragments,
                &coord_tiles,
            )?;
            sort_coords(&mut coords, &self.schema, self.layout);
            let deduped = dedup_coords(coords);
            let total_cells = deduped.len() as u64;
            let remaining = &deduped[(self.read_progress as usize).min(deduped.len())..];
            let ranges = compute_cell_ranges(remaining);
            let result = copy_cells(&self.schema, &ranges, remaining.len() as u64, &attr_tiles, &mut self.buffers)?;
            if let Some(buf) = self.buffers.get_mut(COORDS_NAME) {
                copy_coords(remaining, result.cells_copied, buf);
            }
            (result, total_cells)
        };

        self.read_progress += result.cells_copied;
        self.last_overflow = result.overflowed_attribute.clone();
        if self.read_progress < total_cells {
            return Ok(Status::Incomplete);
        }
        // This chunk is fully drained; advance to the next budget-sized
        // partition of the subarray, if any (§4.6).
        self.chunk_idx += 1;
        self.read_progress = 0;
        Ok(if self.chunk_idx < chunks.len() {
            Status::Incomplete
        } else {
            Status::Completed
        })
    }

    fn submit_write(&mut self) -> Result<Status> {
        self.buffers.validate(&self.schema)?;
        let timestamp = now_millis();
        // A write carries explicit coordinates iff the caller attached a
        // `__coords` buffer -- this is what makes it a *sparse* fragment,
        // independent of the schema's own dense/sparse flag (SPEC_FULL.md
        // §9: a dense array legally accumulates sparse update fragments).
        let is_sparse_write = self.buffers.get(COORDS_NAME).is_some();
        let writer = FragmentWriter::new(
            self.storage.as_ref(),
            &self.array_uri,
            &self.thread_id,
            timestamp,
            !is_sparse_write,
        );
        // Recorded before any tile is written, so a failure anywhere
        // below -- mid-write or in finalize's own rename -- leaves behind
        // a URI `clear_fragments()` knows to unlink (§8 S6).
        self.pending_fragment_uri = Some(writer.in_progress_uri().to_string());
        let budget = self.config.memory_budget_cells()?;

        let published = if is_sparse_write {
            let coords = decode_coords_buffer(&self.schema, &self.buffers)?;
            let (meta, _reordered) = writer.write_sparse(&self.schema, self.layout, coords, &self.buffers, budget)?;
            writer.finalize(meta)?
        } else {
            let subarray = self.subarray.clone().ok_or_else(|| {
                Error::Subarray("a dense write requires a subarray".into())
            })?;
            let meta = writer.write_dense(&self.schema, &subarray, self.layout, &self.buffers, budget)?;
            writer.finalize(meta)?
        };

        info!(uri = published.uri(), "fragment published");
        self.written_fragment = Some(published);
        self.pending_fragment_uri = None;
        Ok(Status::Completed)
    }

    /// Idempotent: calling `finalize` more than once, or on a query that
    /// never overflowed, is always safe (§4.7). A `Failed` write's
    /// never-published fragment is unlinked here -- `clear_fragments`
    /// calls this, but a caller may also call `finalize` directly (§7).
    pub fn finalize(&mut self) -> Result<()> {
        if self.status.load() == Status::Failed {
            if let Some(uri) = self.pending_fragment_uri.take() {
                warn!(%uri, "rolling back unpublished fragment");
                self.storage.remove(&uri)?;
            }
        } else if !self.status.load().is_terminal() {
            self.status.store(Status::Completed);
        }
        Ok(())
    }
}

/// A stable textual id for whatever thread calls this, used to name a
/// fragment built by an `async_process` worker (§4.1).
fn executing_thread_id() -> String {
    format!("{:?}", std::thread::current().id())
}

fn decode_coords_buffer(schema: &Schema, buffers: &QueryBuffers) -> Result<Vec<Vec<i64>>> {
    let buf = buffers
        .get(COORDS_NAME)
        .ok_or_else(|| Error::SchemaMismatch("sparse write requires a coordinates buffer".into()))?;
    let ndim = schema.domain.ndim();
    let cell_size = ndim * 8;
    let n = buf.data_size / cell_size;
    let mut out = Vec::with_capacity(n);
    for i in 0..n {
        let start = i * cell_size;
        let coords = (0..ndim)
            .map(|d| {
                let off = start + d * 8;
                i64::from_le_bytes(buf.data[off..off + 8].try_into().unwrap())
            })
            .collect();
        out.push(coords);
    }
    Ok(out)
}
