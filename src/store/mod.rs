//! Shared store contract: directory lifecycle, metadata type tag, key and
//! value validation, and run-file naming.
//!
//! ## Design Overview
//!
//! Every engine owns a data directory laid out as:
//!
//! ```text
//! <data_dir>/
//!   metadata            JSON: { "type": "lsmtree" | "hybridlog" | ... }
//!   wal                 LSMTree only: append-only record stream
//!   L{level}.{run}.run       immutable record stream
//!   L{level}.{run}.filter    LSMTree only: bloom filter envelope
//!   L{level}.{run}.pointers  LSMTree only: fence pointer envelope
//! ```
//!
//! The metadata tag is written when a directory is first claimed and is
//! checked on every open, so an LSMTree directory can never be opened as,
//! say, an append log. [`StoreBase`] bundles this lifecycle with the
//! record codec, the key/value limits, and the optional replica so the
//! engines share one implementation of all of it.
//!
//! ## Guarantees
//!
//! - Precondition failures (empty key, oversize key or value) surface
//!   before any state change.
//! - Opening a directory tagged for another engine type fails.
//! - `get` returns the empty value for absent keys; storing the empty
//!   value is the delete operation. The two are indistinguishable by
//!   design.

#[cfg(test)]
mod tests;

use std::fmt;
use std::fs::{self, File};
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::bloom::BloomError;
use crate::fence::FenceError;
use crate::record::RecordCodec;
use crate::replica::{Replica, ReplicaError};

// ------------------------------------------------------------------------------------------------
// Constants
// ------------------------------------------------------------------------------------------------

/// Default maximum key length in bytes.
pub const DEFAULT_MAX_KEY_LEN: usize = 255;

/// Default maximum value length in bytes.
pub const DEFAULT_MAX_VALUE_LEN: usize = 255;

// ------------------------------------------------------------------------------------------------
// Error Types
// ------------------------------------------------------------------------------------------------

/// Errors surfaced by every engine's public entry points.
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Keys must be non-empty.
    #[error("empty key")]
    EmptyKey,

    /// Key longer than the configured limit.
    #[error("key length {len} exceeds limit {max}")]
    KeyTooLong { len: usize, max: usize },

    /// Value longer than the configured limit.
    #[error("value length {len} exceeds limit {max}")]
    ValueTooLong { len: usize, max: usize },

    /// The data directory is tagged for a different engine type.
    #[error("data directory holds a {found:?} store, expected {expected}")]
    EngineTypeMismatch { expected: EngineType, found: String },

    /// Invalid engine configuration.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Metadata file was unreadable.
    #[error("metadata error: {0}")]
    Metadata(#[from] serde_json::Error),

    /// A run's bloom filter sidecar was unreadable.
    #[error("bloom filter error: {0}")]
    Filter(#[from] BloomError),

    /// A run's fence pointer sidecar was unreadable.
    #[error("fence pointer error: {0}")]
    Pointers(#[from] FenceError),

    /// Replica operation failed.
    #[error("replica error: {0}")]
    Replica(#[from] ReplicaError),

    /// Internal invariant violation.
    #[error("internal error: {0}")]
    Internal(String),
}

// ------------------------------------------------------------------------------------------------
// Engine identity
// ------------------------------------------------------------------------------------------------

/// The four engine flavors, as recorded in the metadata type tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineType {
    LsmTree,
    HybridLog,
    AppendLog,
    MemOnly,
}

impl EngineType {
    /// The tag string stored in `metadata`.
    pub fn tag(self) -> &'static str {
        match self {
            EngineType::LsmTree => "lsmtree",
            EngineType::HybridLog => "hybridlog",
            EngineType::AppendLog => "appendlog",
            EngineType::MemOnly => "memonly",
        }
    }
}

impl fmt::Display for EngineType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.tag())
    }
}

/// Identity of a record inside the level/run file hierarchy. Doubles as
/// the hash-index payload and as the liveness check during merges.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunRecord {
    /// Level the record's run belongs to.
    pub level: usize,
    /// Run index within the level.
    pub run: usize,
    /// Byte offset of the record inside the run file.
    pub offset: u64,
}

#[derive(Debug, Serialize, Deserialize)]
struct Metadata {
    #[serde(rename = "type")]
    engine: String,
}

// ------------------------------------------------------------------------------------------------
// Contract
// ------------------------------------------------------------------------------------------------

/// The shared contract every engine exposes.
///
/// Setting the empty value deletes a key; `get` returns the empty value
/// for keys that are absent or deleted.
pub trait KvStore {
    /// Looks up `key`, returning its value or the empty value.
    fn get(&mut self, key: &[u8]) -> Result<Vec<u8>, StoreError>;

    /// Writes `key` to `value`. The empty value is a tombstone.
    fn set(&mut self, key: &[u8], value: &[u8]) -> Result<(), StoreError>;

    /// Deletes `key` (shorthand for setting the empty value).
    fn delete(&mut self, key: &[u8]) -> Result<(), StoreError> {
        self.set(key, &[])
    }

    /// Pushes the current state to the replica, if one is attached.
    fn snapshot(&mut self) -> Result<(), StoreError>;

    /// Rebuilds local state from the replica's snapshot `version` (the
    /// latest when `None`). Returns `false` when no replica is attached
    /// or the snapshot cannot be served; local files are then kept.
    fn restore(&mut self, version: Option<u64>) -> Result<bool, StoreError>;

    /// Flushes and releases resources. The store must not be used after.
    fn close(&mut self) -> Result<(), StoreError>;
}

// ------------------------------------------------------------------------------------------------
// Shared engine state
// ------------------------------------------------------------------------------------------------

/// State common to all engines: the data directory, limits, codec,
/// metadata tag, and the optional replica.
pub struct StoreBase {
    pub data_dir: PathBuf,
    pub max_key_len: usize,
    pub max_value_len: usize,
    pub codec: RecordCodec,
    pub engine: EngineType,
    pub replica: Option<Box<dyn Replica>>,
}

impl StoreBase {
    /// Claims (or re-opens) `data_dir` for `engine`.
    ///
    /// Creates the directory if needed, verifies the metadata type tag
    /// against `engine`, and writes the tag if the directory is fresh.
    pub fn open(
        data_dir: impl AsRef<Path>,
        max_key_len: usize,
        max_value_len: usize,
        engine: EngineType,
        replica: Option<Box<dyn Replica>>,
    ) -> Result<Self, StoreError> {
        if max_key_len == 0 {
            return Err(StoreError::InvalidConfig("max_key_len must be > 0".into()));
        }
        if max_value_len == 0 {
            return Err(StoreError::InvalidConfig(
                "max_value_len must be > 0".into(),
            ));
        }

        let data_dir = data_dir.as_ref().to_path_buf();
        fs::create_dir_all(&data_dir)?;

        let base = Self {
            data_dir,
            max_key_len,
            max_value_len,
            codec: RecordCodec::new(max_key_len, max_value_len),
            engine,
            replica,
        };

        let metadata_path = base.metadata_path();
        if metadata_path.is_file() {
            let metadata: Metadata = serde_json::from_str(&fs::read_to_string(&metadata_path)?)?;
            if metadata.engine != engine.tag() {
                return Err(StoreError::EngineTypeMismatch {
                    expected: engine,
                    found: metadata.engine,
                });
            }
        } else {
            base.save_metadata()?;
        }

        Ok(base)
    }

    /// Writes the metadata type tag. Also used after a replica restore
    /// wipes the directory.
    pub fn save_metadata(&self) -> Result<(), StoreError> {
        let metadata = Metadata {
            engine: self.engine.tag().to_string(),
        };
        fs::write(self.metadata_path(), serde_json::to_string(&metadata)?)?;
        Ok(())
    }

    pub fn metadata_path(&self) -> PathBuf {
        self.data_dir.join("metadata")
    }

    pub fn run_path(&self, level: usize, run: usize) -> PathBuf {
        self.data_dir.join(format!("L{level}.{run}.run"))
    }

    pub fn filter_path(&self, level: usize, run: usize) -> PathBuf {
        self.data_dir.join(format!("L{level}.{run}.filter"))
    }

    pub fn pointers_path(&self, level: usize, run: usize) -> PathBuf {
        self.data_dir.join(format!("L{level}.{run}.pointers"))
    }

    /// Counts run files per level (`result[level]` = number of runs).
    ///
    /// Run indices within a level are always contiguous from 0, so counts
    /// are enough to re-open every run.
    pub fn discover_levels(&self) -> Result<Vec<usize>, StoreError> {
        let mut counts: Vec<usize> = Vec::new();
        for entry in fs::read_dir(&self.data_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            let Some(level) = parse_run_file_level(name) else {
                continue;
            };
            if counts.len() <= level {
                counts.resize(level + 1, 0);
            }
            counts[level] += 1;
        }
        Ok(counts)
    }

    /// Validates a key against the contract: non-empty, within the limit.
    pub fn check_key(&self, key: &[u8]) -> Result<(), StoreError> {
        if key.is_empty() {
            return Err(StoreError::EmptyKey);
        }
        if key.len() > self.max_key_len {
            return Err(StoreError::KeyTooLong {
                len: key.len(),
                max: self.max_key_len,
            });
        }
        Ok(())
    }

    /// Validates a value length against the limit.
    pub fn check_value(&self, value: &[u8]) -> Result<(), StoreError> {
        if value.len() > self.max_value_len {
            return Err(StoreError::ValueTooLong {
                len: value.len(),
                max: self.max_value_len,
            });
        }
        Ok(())
    }

    /// Best-effort fsync of the data directory itself, so file creations
    /// and unlinks survive a crash after close.
    pub fn sync_dir(&self) -> Result<(), StoreError> {
        if let Ok(dir) = File::open(&self.data_dir) {
            dir.sync_all()?;
        }
        Ok(())
    }
}

/// Level index of a `L{level}.{run}.run` file name, if it is one.
fn parse_run_file_level(name: &str) -> Option<usize> {
    let stem = name.strip_prefix('L')?.strip_suffix(".run")?;
    let (level, run) = stem.split_once('.')?;
    let level = level.parse::<usize>().ok()?;
    run.parse::<usize>().ok()?;
    Some(level)
}
