//! Query configuration (§9).
//!
//! A flat string key/value store, mirroring the teacher's
//! `Config::set("sm.var_offsets.bitsize", "64")` convention rather than a
//! typed struct-of-fields -- this keeps tunables discoverable by name and
//! lets a caller set one the core doesn't recognize without a compile-time
//! schema change, exactly as the wrapped C config object behaves.

use std::collections::HashMap;

use crate::error::{Error, Result};

/// `sm.memory_budget` default, in cells: the per-attribute buffer budget
/// [`crate::ordered_state::compute_subarrays`] partitions reads against
/// when a query does not override it.
pub const DEFAULT_MEMORY_BUDGET_CELLS: &str = "1048576";

#[derive(Clone, Debug)]
pub struct Config {
    values: HashMap<String, String>,
}

impl Default for Config {
    fn default() -> Self {
        let mut values = HashMap::new();
        values.insert("sm.memory_budget".to_string(), DEFAULT_MEMORY_BUDGET_CELLS.to_string());
        values.insert("sm.var_offsets.mode".to_string(), "bytes".to_string());
        Config { values }
    }
}

impl Config {
    pub fn new() -> Self {
        Config::default()
    }

    pub fn set(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Self {
        self.values.insert(key.into(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.values.get(key).map(|s| s.as_str())
    }

    pub fn memory_budget_cells(&self) -> Result<u64> {
        let raw = self.get("sm.memory_budget").unwrap_or(DEFAULT_MEMORY_BUDGET_CELLS);
        raw.parse()
            .map_err(|_| Error::Config(format!("sm.memory_budget is not a valid integer: '{raw}'")))
    }
}
