//! In-memory engine persisted lazily to a single run file.
//!
//! All state is one hash map. `flush` rewrites `L0.0.run` wholesale;
//! `snapshot` flushes and pushes the run to the replica, so every
//! snapshot is one global version and `restore(version)` returns the
//! store to exactly the chosen snapshot (the replica's degenerate
//! single-slot expansion). Nothing is written between snapshots, making
//! this engine a minimal host for the snapshot/restore protocol and a
//! reference point for the disk-resident engines.

#[cfg(test)]
mod tests;

use std::collections::HashMap;
use std::fs::File;
use std::io::BufWriter;
use std::path::PathBuf;

use tracing::debug;

use crate::replica::Replica;
use crate::store::{
    DEFAULT_MAX_KEY_LEN, DEFAULT_MAX_VALUE_LEN, EngineType, KvStore, StoreBase, StoreError,
};

/// Configuration for [`MemOnly::open`].
pub struct MemOnlyConfig {
    /// Maximum key length in bytes.
    pub max_key_len: usize,

    /// Maximum value length in bytes.
    pub max_value_len: usize,

    /// Optional replica receiving snapshots.
    pub replica: Option<Box<dyn Replica>>,
}

impl Default for MemOnlyConfig {
    fn default() -> Self {
        Self {
            max_key_len: DEFAULT_MAX_KEY_LEN,
            max_value_len: DEFAULT_MAX_VALUE_LEN,
            replica: None,
        }
    }
}

/// Purely in-memory store with snapshot persistence.
pub struct MemOnly {
    base: StoreBase,
    map: HashMap<Vec<u8>, Vec<u8>>,
}

impl MemOnly {
    /// Opens (or creates) a store rooted at `data_dir`, loading the last
    /// flushed state (local or replicated).
    pub fn open(data_dir: impl Into<PathBuf>, config: MemOnlyConfig) -> Result<Self, StoreError> {
        let base = StoreBase::open(
            data_dir.into(),
            config.max_key_len,
            config.max_value_len,
            EngineType::MemOnly,
            config.replica,
        )?;

        let mut store = Self {
            base,
            map: HashMap::new(),
        };
        store.rebuild_indices()?;
        if store.base.replica.is_some() {
            store.restore(None)?;
        }
        Ok(store)
    }

    /// Reloads the map from the run file, if one exists.
    fn rebuild_indices(&mut self) -> Result<(), StoreError> {
        self.map.clear();
        let run_path = self.base.run_path(0, 0);
        if !run_path.is_file() {
            return Ok(());
        }
        let mut fd = File::open(&run_path)?;
        while let Some((key, value)) = self.base.codec.read_record(&mut fd)? {
            self.map.insert(key, value);
        }
        debug!(records = self.map.len(), "loaded run file");
        Ok(())
    }

    /// Rewrites the run file from the current map.
    fn flush(&mut self) -> Result<(), StoreError> {
        let run_path = self.base.run_path(0, 0);
        let codec = self.base.codec;
        let mut writer = BufWriter::new(File::create(&run_path)?);
        for (key, value) in &self.map {
            codec.write_record(&mut writer, key, value)?;
        }
        let file = writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        debug!(records = self.map.len(), "flushed map to run file");
        Ok(())
    }
}

impl KvStore for MemOnly {
    fn get(&mut self, key: &[u8]) -> Result<Vec<u8>, StoreError> {
        self.base.check_key(key)?;
        Ok(self.map.get(key).cloned().unwrap_or_default())
    }

    fn set(&mut self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.base.check_key(key)?;
        self.base.check_value(value)?;

        if value.is_empty() {
            self.map.remove(key);
        } else {
            self.map.insert(key.to_vec(), value.to_vec());
        }
        Ok(())
    }

    fn snapshot(&mut self) -> Result<(), StoreError> {
        self.flush()?;
        if let Some(replica) = self.base.replica.as_mut() {
            replica.put("L0.0.run")?;
        }
        Ok(())
    }

    fn restore(&mut self, version: Option<u64>) -> Result<bool, StoreError> {
        self.flush()?;

        let Some(replica) = self.base.replica.as_mut() else {
            return Ok(false);
        };
        // The single-slot degenerate expansion: max_per_level of 1.
        let restored = replica.restore(1, version)?;
        if restored {
            self.base.save_metadata()?;
            self.rebuild_indices()?;
        }
        Ok(restored)
    }

    fn close(&mut self) -> Result<(), StoreError> {
        self.snapshot()?;
        self.base.save_metadata()?;
        self.base.sync_dir()
    }
}
