//! Hybrid log engine: an in-memory ring in front of on-disk runs, after
//! Microsoft's FASTER design.
//!
//! ## Design Overview
//!
//! Every record lives at a monotonically increasing 64-bit logical
//! address (LA). Three offsets partition the LA space:
//!
//! ```text
//! ---------------------------------------------
//! |        |             |            :
//! |  disk  |   ro mem    |   rw mem   :
//! |        |             |            :
//! ---------------------------------------------
//! ^        ^             ^            ^
//! 0        head          ro           tail
//! ```
//!
//! - `(0, head]`: records flushed to run files, located through the
//!   LA-to-file map.
//! - `(head, ro]`: the read-only region of the ring; updates to keys
//!   here append a fresh record at the tail.
//! - `(ro, tail]`: the mutable region; updates overwrite in place.
//!
//! The hash index maps each key to the LA of its newest record.
//! Invariants: `head <= ro <= tail` and `tail - head <= mem_segment_len`.
//!
//! ## Flush, rotation, merge
//!
//! A flush drains the ring up to a target LA, appending records to a
//! fresh level-0 run. Records whose hash-index LA moved past the drained
//! one are dropped on the way out (in-memory compaction). Each flush
//! that produces at least one live record seals one run; when level 0
//! reaches `max_runs_per_level` runs they are merged into the next level
//! like an LSM tree, except liveness comes from the hash index plus the
//! LA-to-file map instead of sort order, and there are no sidecars.
//!
//! ## Recovery
//!
//! Runs are scanned deepest level first, runs in ascending order,
//! assigning LAs in scan order so newer duplicates overwrite older index
//! entries. Afterwards `head = ro = tail =` the number of scanned
//! records and the ring restarts above that base. A clean close flushes
//! the whole ring, losing nothing.

#[cfg(test)]
mod tests;

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufWriter, Seek, SeekFrom};
use std::path::PathBuf;

use tracing::{debug, info, warn};

use crate::replica::Replica;
use crate::ring::RingBuffer;
use crate::store::{
    DEFAULT_MAX_KEY_LEN, DEFAULT_MAX_VALUE_LEN, EngineType, KvStore, RunRecord, StoreBase,
    StoreError,
};

/// Hash index implementation selector.
///
/// Only the map-backed index is implemented; `Native` is accepted for
/// compatibility and falls back to `Dict` with a warning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum HashIndexKind {
    #[default]
    Dict,
    Native,
}

/// Configuration for [`HybridLog::open`].
pub struct HybridLogConfig {
    /// Maximum key length in bytes.
    pub max_key_len: usize,

    /// Maximum value length in bytes.
    pub max_value_len: usize,

    /// Ring capacity in records; bounds `tail - head`. Must be at least
    /// `ro_lag_interval + flush_interval`.
    pub mem_segment_len: u64,

    /// How far the tail may run ahead of the read-only boundary.
    pub ro_lag_interval: u64,

    /// How large the read-only region may grow before it is flushed.
    pub flush_interval: u64,

    /// Sealed runs a level may accumulate before merging.
    pub max_runs_per_level: usize,

    /// Hash index implementation.
    pub hash_index: HashIndexKind,

    /// Rewrite each sealed run in place, dropping stale records. The
    /// merge already drops them; this is optional extra compaction.
    pub compaction_enabled: bool,

    /// Optional replica receiving sealed runs.
    pub replica: Option<Box<dyn Replica>>,
}

impl Default for HybridLogConfig {
    fn default() -> Self {
        Self {
            max_key_len: DEFAULT_MAX_KEY_LEN,
            max_value_len: DEFAULT_MAX_VALUE_LEN,
            mem_segment_len: 1 << 20,
            ro_lag_interval: 1 << 10,
            flush_interval: 4 * (1 << 10),
            max_runs_per_level: 3,
            hash_index: HashIndexKind::Dict,
            compaction_enabled: false,
            replica: None,
        }
    }
}

/// FASTER-style hybrid log over a data directory.
pub struct HybridLog {
    base: StoreBase,
    mem_segment_len: u64,
    ro_lag_interval: u64,
    flush_interval: u64,
    max_runs_per_level: usize,
    compaction_enabled: bool,

    /// Key to the LA of its newest record.
    hash_index: HashMap<Vec<u8>, u64>,
    /// On-disk location of every flushed LA still worth knowing about.
    la_to_file: HashMap<u64, RunRecord>,

    head_offset: u64,
    ro_offset: u64,
    tail_offset: u64,
    ring: RingBuffer<(Vec<u8>, Vec<u8>)>,

    /// Sealed runs per level.
    levels: Vec<usize>,
    /// Retained read handles, parallel to `levels`.
    rfds: Vec<Vec<File>>,
}

impl HybridLog {
    /// Opens (or creates) a hybrid log rooted at `data_dir`.
    pub fn open(data_dir: impl Into<PathBuf>, config: HybridLogConfig) -> Result<Self, StoreError> {
        if config.ro_lag_interval == 0 {
            return Err(StoreError::InvalidConfig(
                "ro_lag_interval must be > 0".into(),
            ));
        }
        if config.flush_interval == 0 {
            return Err(StoreError::InvalidConfig(
                "flush_interval must be > 0".into(),
            ));
        }
        if config.mem_segment_len < config.ro_lag_interval + config.flush_interval {
            return Err(StoreError::InvalidConfig(
                "mem_segment_len must be at least ro_lag_interval + flush_interval".into(),
            ));
        }
        if config.max_runs_per_level < 2 {
            return Err(StoreError::InvalidConfig(
                "max_runs_per_level must be at least 2".into(),
            ));
        }
        if config.hash_index == HashIndexKind::Native {
            warn!("native hash index is not implemented; using the map-backed index");
        }

        let base = StoreBase::open(
            data_dir.into(),
            config.max_key_len,
            config.max_value_len,
            EngineType::HybridLog,
            config.replica,
        )?;

        let mut log = Self {
            base,
            mem_segment_len: config.mem_segment_len,
            ro_lag_interval: config.ro_lag_interval,
            flush_interval: config.flush_interval,
            max_runs_per_level: config.max_runs_per_level,
            compaction_enabled: config.compaction_enabled,
            hash_index: HashMap::new(),
            la_to_file: HashMap::new(),
            head_offset: 0,
            ro_offset: 0,
            tail_offset: 0,
            ring: RingBuffer::new(config.mem_segment_len),
            levels: Vec::new(),
            rfds: Vec::new(),
        };

        log.rebuild_indices()?;
        if log.base.replica.is_some() {
            log.restore(None)?;
        }
        Ok(log)
    }

    /// Current `(head, ro, tail)` offsets partitioning the LA space.
    pub fn offsets(&self) -> (u64, u64, u64) {
        (self.head_offset, self.ro_offset, self.tail_offset)
    }

    /// Rebuilds the hash index and LA-to-file map by scanning run files,
    /// deepest level first so newer records overwrite older entries.
    fn rebuild_indices(&mut self) -> Result<(), StoreError> {
        self.hash_index.clear();
        self.la_to_file.clear();

        self.levels = self.base.discover_levels()?;
        self.rfds = Vec::with_capacity(self.levels.len());
        for (level, &n_runs) in self.levels.iter().enumerate() {
            let mut fds = Vec::with_capacity(n_runs);
            for run in 0..n_runs {
                fds.push(File::open(self.base.run_path(level, run))?);
            }
            self.rfds.push(fds);
        }

        let codec = self.base.codec;
        let mut la = 0u64;
        for level in (0..self.levels.len()).rev() {
            for run in 0..self.levels[level] {
                let fd = &mut self.rfds[level][run];
                fd.seek(SeekFrom::Start(0))?;
                let mut offset = 0u64;
                while let Some((key, value)) = codec.read_record(fd)? {
                    let len = codec.encoded_len(&key, &value);
                    la += 1;
                    self.hash_index.insert(key, la);
                    self.la_to_file.insert(la, RunRecord { level, run, offset });
                    offset += len;
                }
            }
        }

        self.head_offset = la;
        self.ro_offset = la;
        self.tail_offset = la;
        self.ring = RingBuffer::with_base(self.mem_segment_len, la);
        debug!(records = la, levels = ?self.levels, "rebuilt log indices");
        Ok(())
    }

    /// Drains the ring up to `target`, sealing the drained records into
    /// a fresh level-0 run. Records whose index entry moved past the
    /// drained LA are dropped. Merges level 0 if it filled up.
    fn flush_to(&mut self, target: u64) -> Result<(), StoreError> {
        if self.head_offset >= target {
            return Ok(());
        }
        if self.levels.is_empty() {
            self.levels.push(0);
            self.rfds.push(Vec::new());
        }

        let run_idx = self.levels[0];
        let run_path = self.base.run_path(0, run_idx);
        let codec = self.base.codec;

        let mut writer = BufWriter::new(File::create(&run_path)?);
        let mut offset = 0u64;
        let mut written = 0u64;
        while self.head_offset < target {
            let (key, value) = self
                .ring
                .pop()
                .map_err(|e| StoreError::Internal(format!("ring drain: {e}")))?;
            self.head_offset += 1;
            let la = self.head_offset;
            if self.hash_index.get(&key) != Some(&la) {
                // Superseded while still in memory; compacted away.
                continue;
            }
            let record_offset = offset;
            offset += codec.write_record(&mut writer, &key, &value)?;
            self.la_to_file.insert(
                la,
                RunRecord {
                    level: 0,
                    run: run_idx,
                    offset: record_offset,
                },
            );
            written += 1;
        }
        let file = writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;

        if written == 0 {
            // Nothing lived long enough to reach disk.
            fs::remove_file(&run_path)?;
            return Ok(());
        }

        self.rfds[0].push(File::open(&run_path)?);
        self.levels[0] += 1;
        debug!(records = written, run = run_idx, "sealed run");

        if self.compaction_enabled {
            self.compact_run(0, run_idx)?;
        }
        if let Some(replica) = self.base.replica.as_mut() {
            replica.put(&format!("L0.{run_idx}.run"))?;
        }
        if self.levels[0] >= self.max_runs_per_level {
            self.merge(0)?;
        }
        Ok(())
    }

    /// Rewrites one sealed run into a `.tmp` sibling keeping only
    /// records the index still references, then renames it into place.
    fn compact_run(&mut self, level: usize, run: usize) -> Result<(), StoreError> {
        let run_path = self.base.run_path(level, run);
        let tmp_path = run_path.with_extension("tmp");
        let codec = self.base.codec;

        let mut src = File::open(&run_path)?;
        let mut writer = BufWriter::new(File::create(&tmp_path)?);
        let mut src_offset = 0u64;
        let mut dst_offset = 0u64;
        let mut kept = 0u64;

        while let Some((key, value)) = codec.read_record(&mut src)? {
            let len = codec.encoded_len(&key, &value);
            let current = RunRecord {
                level,
                run,
                offset: src_offset,
            };
            if let Some(&la) = self.hash_index.get(&key)
                && la <= self.head_offset
                && self.la_to_file.get(&la) == Some(&current)
            {
                let new_offset = dst_offset;
                dst_offset += codec.write_record(&mut writer, &key, &value)?;
                self.la_to_file.insert(
                    la,
                    RunRecord {
                        level,
                        run,
                        offset: new_offset,
                    },
                );
                kept += 1;
            }
            src_offset += len;
        }

        let file = writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        fs::rename(&tmp_path, &run_path)?;
        // The retained read handle still points at the replaced inode.
        self.rfds[level][run] = File::open(&run_path)?;
        debug!(level, run, kept, "compacted run in place");
        Ok(())
    }

    /// Moves every live record at `level` into a single run at
    /// `level + 1`, dropping records the index no longer references.
    fn merge(&mut self, level: usize) -> Result<(), StoreError> {
        let n_inputs = self.levels[level];
        info!(level, runs = n_inputs, "merging level");

        if level + 1 >= self.levels.len() {
            self.levels.push(0);
            self.rfds.push(Vec::new());
        }
        let next_run = self.levels[level + 1];
        let codec = self.base.codec;

        let out_path = self.base.run_path(level + 1, next_run);
        let mut writer = BufWriter::new(File::create(&out_path)?);
        let mut dst_offset = 0u64;

        for run in 0..n_inputs {
            let fd = &mut self.rfds[level][run];
            fd.seek(SeekFrom::Start(0))?;
            let mut src_offset = 0u64;
            while let Some((key, value)) = codec.read_record(fd)? {
                let len = codec.encoded_len(&key, &value);
                let current = RunRecord {
                    level,
                    run,
                    offset: src_offset,
                };
                if let Some(&la) = self.hash_index.get(&key)
                    && la <= self.head_offset
                    && self.la_to_file.get(&la) == Some(&current)
                {
                    let new_offset = dst_offset;
                    dst_offset += codec.write_record(&mut writer, &key, &value)?;
                    self.la_to_file.insert(
                        la,
                        RunRecord {
                            level: level + 1,
                            run: next_run,
                            offset: new_offset,
                        },
                    );
                }
                src_offset += len;
            }
        }

        let file = writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;

        self.rfds[level + 1].push(File::open(&out_path)?);
        self.rfds[level].clear();
        for run in 0..n_inputs {
            fs::remove_file(self.base.run_path(level, run))?;
        }
        // Whatever still points at the merged level was stale.
        self.la_to_file.retain(|_, rec| rec.level != level);
        self.levels[level] = 0;
        self.levels[level + 1] += 1;
        info!(level, merged = n_inputs, out_run = next_run, "merge complete");

        if let Some(replica) = self.base.replica.as_mut() {
            let l = level + 1;
            replica.put(&format!("L{l}.{next_run}.run"))?;
        }

        if self.levels[level + 1] >= self.max_runs_per_level {
            self.merge(level + 1)?;
        }
        Ok(())
    }
}

impl KvStore for HybridLog {
    fn get(&mut self, key: &[u8]) -> Result<Vec<u8>, StoreError> {
        self.base.check_key(key)?;

        let Some(&la) = self.hash_index.get(key) else {
            return Ok(Vec::new());
        };

        if la > self.head_offset {
            let Some((_, value)) = self.ring.get(la) else {
                return Err(StoreError::Internal(format!(
                    "logical address {la} missing from the ring"
                )));
            };
            return Ok(value.clone());
        }

        let Some(&rec) = self.la_to_file.get(&la) else {
            return Err(StoreError::Internal(format!(
                "logical address {la} missing from the file map"
            )));
        };
        let codec = self.base.codec;
        let fd = &mut self.rfds[rec.level][rec.run];
        fd.seek(SeekFrom::Start(rec.offset))?;
        match codec.read_record(fd)? {
            Some((read_key, value)) if read_key == key => Ok(value),
            _ => Err(StoreError::Internal(format!(
                "record at {rec:?} does not match its index entry"
            ))),
        }
    }

    fn set(&mut self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.base.check_key(key)?;
        self.base.check_value(value)?;

        if self.ring.is_full() {
            let ro = self.ro_offset;
            self.flush_to(ro)?;
        }

        // In-place update while the record is still in the mutable
        // region.
        if let Some(&la) = self.hash_index.get(key)
            && la > self.ro_offset
        {
            self.ring
                .replace(la, (key.to_vec(), value.to_vec()))
                .map_err(|e| StoreError::Internal(format!("in-place update: {e}")))?;
            return Ok(());
        }

        let la = self
            .ring
            .add((key.to_vec(), value.to_vec()))
            .map_err(|e| StoreError::Internal(format!("ring append: {e}")))?;
        self.tail_offset = la;
        self.hash_index.insert(key.to_vec(), la);

        if self.tail_offset - self.ro_offset > self.ro_lag_interval {
            self.ro_offset += 1;
        }
        if self.ro_offset - self.head_offset > self.flush_interval {
            let ro = self.ro_offset;
            self.flush_to(ro)?;
        }
        Ok(())
    }

    fn snapshot(&mut self) -> Result<(), StoreError> {
        let tail = self.tail_offset;
        self.ro_offset = tail;
        self.flush_to(tail)
    }

    fn restore(&mut self, version: Option<u64>) -> Result<bool, StoreError> {
        // Seal pending records so they are part of the replica's state.
        self.snapshot()?;

        let Some(replica) = self.base.replica.as_mut() else {
            return Ok(false);
        };
        let restored = replica.restore(self.max_runs_per_level as u64, version)?;
        if restored {
            // The replica wiped the directory: re-tag it and rebuild
            // everything from the fetched runs. On refusal the current
            // local state is untouched and stays authoritative.
            self.base.save_metadata()?;
            self.rebuild_indices()?;
        }
        Ok(restored)
    }

    fn close(&mut self) -> Result<(), StoreError> {
        // A clean close flushes everything above the head.
        let tail = self.tail_offset;
        self.ro_offset = tail;
        self.flush_to(tail)?;
        self.base.save_metadata()?;
        self.rfds.clear();
        self.base.sync_dir()
    }
}
