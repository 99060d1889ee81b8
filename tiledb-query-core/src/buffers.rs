//! Owned query buffers (§4.3, §6, §9).
//!
//! The teacher's FFI layer hands the caller raw `*mut c_void` buffer pairs;
//! this core instead owns a `Vec<u8>` per attribute (plus an optional
//! offsets `Vec<u8>`) and tracks how much of each was actually filled, so a
//! `Query` can resume a read across an `Incomplete` result without the
//! caller re-supplying byte ranges by hand.

use std::collections::HashMap;

use tiledb_common::schema::Schema;

use crate::error::{Error, Result};

/// One attribute's buffer pair and the high-water mark the last read/write
/// left in each.
#[derive(Clone, Debug, Default)]
pub struct AttributeBuffer {
    /// Fixed-size attributes: raw cell bytes. Variable-sized attributes:
    /// the concatenated variable-length payloads.
    pub data: Vec<u8>,
    /// Bytes of `data` actually in use after the last read, or supplied by
    /// the caller before a write.
    pub data_size: usize,
    /// Variable-sized attributes only: cell start offsets into `data`, one
    /// `u64` per cell (not byte-packed -- `offsets.len() / 8` cells).
    pub offsets: Option<Vec<u8>>,
    pub offsets_size: usize,
}

impl AttributeBuffer {
    pub fn fixed(capacity: usize) -> Self {
        AttributeBuffer {
            data: vec![0u8; capacity],
            data_size: 0,
            offsets: None,
            offsets_size: 0,
        }
    }

    pub fn var(data_capacity: usize, offsets_capacity: usize) -> Self {
        AttributeBuffer {
            data: vec![0u8; data_capacity],
            data_size: 0,
            offsets: Some(vec![0u8; offsets_capacity]),
            offsets_size: 0,
        }
    }

    pub fn is_var(&self) -> bool {
        self.offsets.is_some()
    }

    /// Clears the filled-size bookkeeping without reallocating, readying
    /// the buffer to be refilled by a resumed read (§4.7 overflow
    /// resubmission: the caller is expected to have drained `data`/
    /// `offsets` up to the previous sizes before resubmitting).
    pub fn zero_fill(&mut self) {
        self.data_size = 0;
        self.offsets_size = 0;
    }
}

/// The full set of buffers attached to a `Query`, keyed by attribute name
/// (coordinates use [`tiledb_common::schema::COORDS_NAME`]).
#[derive(Clone, Debug, Default)]
pub struct QueryBuffers {
    buffers: HashMap<String, AttributeBuffer>,
    /// Insertion order, preserved so `buffer_index` is stable across calls
    /// -- the overflow-resubmission protocol (§4.7 invariant 6) reports
    /// overflow by index, not by name, matching the teacher's C buffer
    /// array convention.
    order: Vec<String>,
}

impl QueryBuffers {
    pub fn new() -> Self {
        QueryBuffers::default()
    }

    pub fn set(&mut self, name: impl Into<String>, buffer: AttributeBuffer) {
        let name = name.into();
        if !self.buffers.contains_key(&name) {
            self.order.push(name.clone());
        }
        self.buffers.insert(name, buffer);
    }

    pub fn get(&self, name: &str) -> Option<&AttributeBuffer> {
        self.buffers.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut AttributeBuffer> {
        self.buffers.get_mut(name)
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.order.iter().map(|s| s.as_str())
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// The stable 0-based position of `name` among the attached buffers,
    /// used to report which buffer overflowed (§4.7 invariant 6,
    /// `Query::overflow_attribute`).
    pub fn buffer_index(&self, name: &str) -> Option<usize> {
        self.order.iter().position(|n| n == name)
    }

    /// Resets every buffer's filled-size bookkeeping to zero, readying the
    /// set for a resumed read.
    pub fn zero_fill(&mut self) {
        for buf in self.buffers.values_mut() {
            buf.zero_fill();
        }
    }

    /// Validates that every attached buffer names a real attribute (or the
    /// coordinates pseudo-attribute for a sparse schema) and matches its
    /// fixed/var-ness.
    pub fn validate(&self, schema: &Schema) -> Result<()> {
        for name in self.order.iter() {
            let buf = &self.buffers[name];
            if name == tiledb_common::schema::COORDS_NAME {
                if buf.is_var() {
                    return Err(Error::SchemaMismatch(
                        "coordinates buffer may not be variable-sized".into(),
                    ));
                }
                continue;
            }
            let attr = schema.attribute(name)?;
            if attr.cell_val_num.is_var() != buf.is_var() {
                return Err(Error::SchemaMismatch(format!(
                    "attribute '{name}' var-sized-ness does not match its buffer"
                )));
            }
        }
        Ok(())
    }
}
