//! The storage manager boundary.
//!
//! `SPEC_FULL.md` §1 treats file/object I/O, fragment locking and the VFS
//! as external collaborators. This module defines only the contract the
//! query core consumes (§6) plus an in-memory implementation used by the
//! test suite -- production deployments are expected to supply their own
//! `StorageManager` backed by a real filesystem or object store.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::error::{Error, Result};

/// The I/O and scheduling contract a `Query` depends on.
pub trait StorageManager: Send + Sync {
    /// Reads `nbytes` starting at `offset` from `uri`.
    fn read(&self, uri: &str, offset: u64, nbytes: u64) -> Result<Vec<u8>>;

    /// Appends `bytes` to `uri`, creating it if necessary.
    fn write(&self, uri: &str, bytes: &[u8]) -> Result<()>;

    /// Atomically renames `src` to `dst`. This is the publication point of
    /// a write fragment (§4.1): before this call succeeds, a fragment
    /// under `src` is invisible to `list`.
    fn rename(&self, src: &str, dst: &str) -> Result<()>;

    /// Recursively deletes everything under `uri`. Used for write rollback.
    fn remove(&self, uri: &str) -> Result<()>;

    /// Lists the entries directly under `prefix`, including any
    /// dot-prefixed (in-progress) fragment directories.
    fn list(&self, prefix: &str) -> Result<Vec<String>>;

    /// Hands `task` to a background worker; the calling thread does not
    /// block. Used by `Query::async_process`.
    fn submit_async(&self, task: Box<dyn FnOnce() + Send>) -> Result<()>;
}

/// A single file in the in-memory store.
#[derive(Default, Clone)]
struct MemFile(Vec<u8>);

/// An in-process `StorageManager` used by the test suite. Not part of the
/// production storage engine (§6): no real durability, no real
/// concurrency control beyond a single mutex.
#[derive(Default)]
pub struct MemoryStorageManager {
    files: Mutex<HashMap<String, MemFile>>,
}

impl MemoryStorageManager {
    pub fn new() -> Arc<Self> {
        Arc::new(MemoryStorageManager::default())
    }
}

impl StorageManager for MemoryStorageManager {
    fn read(&self, uri: &str, offset: u64, nbytes: u64) -> Result<Vec<u8>> {
        let files = self.files.lock().unwrap();
        let file = files
            .get(uri)
            .ok_or_else(|| Error::Io(format!("no such file: {uri}")))?;
        let start = offset as usize;
        let end = start + nbytes as usize;
        if end > file.0.len() {
            return Err(Error::Io(format!(
                "read past end of {uri}: [{start}, {end}) of {}",
                file.0.len()
            )));
        }
        Ok(file.0[start..end].to_vec())
    }

    fn write(&self, uri: &str, bytes: &[u8]) -> Result<()> {
        let mut files = self.files.lock().unwrap();
        files.entry(uri.to_string()).or_default().0.extend_from_slice(bytes);
        Ok(())
    }

    fn rename(&self, src: &str, dst: &str) -> Result<()> {
        let mut files = self.files.lock().unwrap();
        let keys: Vec<String> =
            files.keys().filter(|k| k.starts_with(src)).cloned().collect();
        if keys.is_empty() {
            return Err(Error::Io(format!("no such path: {src}")));
        }
        for key in keys {
            let renamed = format!("{dst}{}", &key[src.len()..]);
            let value = files.remove(&key).unwrap();
            files.insert(renamed, value);
        }
        Ok(())
    }

    fn remove(&self, uri: &str) -> Result<()> {
        let mut files = self.files.lock().unwrap();
        files.retain(|k, _| !k.starts_with(uri));
        Ok(())
    }

    fn list(&self, prefix: &str) -> Result<Vec<String>> {
        let files = self.files.lock().unwrap();
        let mut entries: Vec<String> = files
            .keys()
            .filter(|k| k.starts_with(prefix))
            .map(|k| {
                let rest = &k[prefix.len()..];
                let rest = rest.trim_start_matches('/');
                rest.split('/').next().unwrap_or(rest).to_string()
            })
            .filter(|s| !s.is_empty())
            .collect();
        entries.sort();
        entries.dedup();
        Ok(entries)
    }

    fn submit_async(&self, task: Box<dyn FnOnce() + Send>) -> Result<()> {
        std::thread::spawn(task);
        Ok(())
    }
}
