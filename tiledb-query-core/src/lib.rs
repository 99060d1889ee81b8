//! The query execution core: everything a `Query` does between a caller's
//! `init()`/`submit()` calls and the array's fragments on storage,
//! excluding the storage manager itself, the schema-builder API, and tile
//! compression (all external collaborators -- see `SPEC_FULL.md` §1).
//!
//! Read the module list top-to-bottom for the data flow: `overlap` and
//! `tile` narrow a subarray down to candidate bytes, `sparse_read` and
//! `array_read_state` turn those bytes into query results, `ordered_state`
//! and `fragment_writer` do the same in reverse for writes, and `query`
//! ties both directions together behind one lifecycle state machine.

pub mod array_read_state;
pub mod buffers;
pub mod callback;
pub mod config;
pub mod error;
pub mod fragment;
pub mod fragment_writer;
pub mod ordered_state;
pub mod overlap;
pub mod query;
pub mod sparse_read;
pub mod status;
pub mod storage;
pub mod tile;

pub use buffers::{AttributeBuffer, QueryBuffers};
pub use callback::QueryCallback;
pub use config::Config;
pub use error::{Error, Result};
pub use fragment::{FragmentMetadata, FragmentMetadataImpl};
pub use query::{Query, QueryBuilder};
pub use status::Status;
pub use storage::{MemoryStorageManager, StorageManager};

#[cfg(test)]
mod tests;
