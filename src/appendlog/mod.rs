//! Append log engine: per-record durable appends behind a hash index,
//! with size-tiered merging of sealed log files.
//!
//! ## Design Overview
//!
//! Every write is appended to the active level-0 file and the hash index
//! is pointed at its `(level, run, offset)`. Reads are a single index
//! lookup plus one seek. Once `threshold` bytes have been appended the
//! active file is sealed and a fresh one is started; when level 0
//! accumulates `max_runs_per_level` sealed runs they are merged into the
//! next level, copying only records the index still references (the
//! index makes sort order unnecessary), cascading downwards.
//!
//! ## Deletes
//!
//! A tombstone only removes the hash-index entry; nothing is written to
//! disk. The delete therefore holds until close: after a reopen the key
//! resurfaces if an older record for it still lives in some run. Merges
//! drop the unreferenced records, so the window closes over time.
//!
//! ## Recovery
//!
//! The index is rebuilt by scanning runs deepest level first, runs in
//! ascending order, so newer records overwrite older index entries. The
//! active file is flushed per record, hence a crash loses at most the
//! last torn record.

#[cfg(test)]
mod tests;

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{Seek, SeekFrom};
use std::path::PathBuf;

use tracing::{debug, info};

use crate::replica::Replica;
use crate::store::{
    DEFAULT_MAX_KEY_LEN, DEFAULT_MAX_VALUE_LEN, EngineType, KvStore, RunRecord, StoreBase,
    StoreError,
};

/// Configuration for [`AppendLog::open`].
pub struct AppendLogConfig {
    /// Maximum key length in bytes.
    pub max_key_len: usize,

    /// Maximum value length in bytes.
    pub max_value_len: usize,

    /// Sealed runs a level may accumulate before merging. With the
    /// minimum of 1 the level-0 pair (sealed plus active) is merged on
    /// every second seal.
    pub max_runs_per_level: usize,

    /// Bytes of key and value payload after which the active file rolls
    /// over.
    pub threshold: u64,

    /// Optional replica receiving sealed runs.
    pub replica: Option<Box<dyn Replica>>,
}

impl Default for AppendLogConfig {
    fn default() -> Self {
        Self {
            max_key_len: DEFAULT_MAX_KEY_LEN,
            max_value_len: DEFAULT_MAX_VALUE_LEN,
            max_runs_per_level: 3,
            threshold: 4_000_000,
            replica: None,
        }
    }
}

/// Compacted append log over a data directory.
pub struct AppendLog {
    base: StoreBase,
    max_runs_per_level: usize,
    threshold: u64,

    /// Payload bytes appended since the last rollover.
    counter: u64,
    /// Key to the location of its newest record.
    hash_index: HashMap<Vec<u8>, RunRecord>,

    /// Sealed runs per level. The active file is `L0.{levels[0]}.run`
    /// and is not counted until sealed.
    levels: Vec<usize>,
    /// Retained read handles, parallel to `levels`; at level 0 the last
    /// handle reads the active file.
    rfds: Vec<Vec<File>>,

    /// Append handle for the active file.
    wfd: File,
    /// Write offset of the active file.
    wfd_offset: u64,
}

/// On-disk state gathered by one scan of the data directory: sealed run
/// counts, read handles, the rebuilt hash index, and a fresh active file.
struct LogState {
    levels: Vec<usize>,
    rfds: Vec<Vec<File>>,
    hash_index: HashMap<Vec<u8>, RunRecord>,
    wfd: File,
}

impl LogState {
    /// Scans `base.data_dir`, rebuilding the hash index deepest level
    /// first so newer records win, then opens a fresh active file after
    /// the last sealed run.
    fn scan(base: &StoreBase) -> Result<Self, StoreError> {
        let mut levels = base.discover_levels()?;
        if levels.is_empty() {
            levels.push(0);
        }

        let mut rfds = Vec::with_capacity(levels.len());
        for (level, &n_runs) in levels.iter().enumerate() {
            let mut fds = Vec::with_capacity(n_runs);
            for run in 0..n_runs {
                fds.push(File::open(base.run_path(level, run))?);
            }
            rfds.push(fds);
        }

        let codec = base.codec;
        let mut hash_index = HashMap::new();
        let mut records = 0u64;
        for level in (0..levels.len()).rev() {
            for run in 0..levels[level] {
                let fd = &mut rfds[level][run];
                fd.seek(SeekFrom::Start(0))?;
                let mut offset = 0u64;
                while let Some((key, value)) = codec.read_record(fd)? {
                    let len = codec.encoded_len(&key, &value);
                    hash_index.insert(key, RunRecord { level, run, offset });
                    offset += len;
                    records += 1;
                }
            }
        }

        let active_path = base.run_path(0, levels[0]);
        let wfd = File::create(&active_path)?;
        rfds[0].push(File::open(&active_path)?);

        debug!(records, levels = ?levels, "rebuilt hash index");
        Ok(Self {
            levels,
            rfds,
            hash_index,
            wfd,
        })
    }
}

impl AppendLog {
    /// Opens (or creates) an append log rooted at `data_dir`.
    pub fn open(data_dir: impl Into<PathBuf>, config: AppendLogConfig) -> Result<Self, StoreError> {
        if config.max_runs_per_level == 0 {
            return Err(StoreError::InvalidConfig(
                "max_runs_per_level must be at least 1".into(),
            ));
        }
        if config.threshold == 0 {
            return Err(StoreError::InvalidConfig("threshold must be > 0".into()));
        }

        let base = StoreBase::open(
            data_dir.into(),
            config.max_key_len,
            config.max_value_len,
            EngineType::AppendLog,
            config.replica,
        )?;

        let state = LogState::scan(&base)?;
        let mut log = Self {
            base,
            max_runs_per_level: config.max_runs_per_level,
            threshold: config.threshold,
            counter: 0,
            hash_index: state.hash_index,
            levels: state.levels,
            rfds: state.rfds,
            wfd: state.wfd,
            wfd_offset: 0,
        };

        if log.base.replica.is_some() {
            log.restore(None)?;
        }
        Ok(log)
    }

    /// Rediscovers runs, rebuilds the hash index, and opens a fresh
    /// active file.
    fn rebuild_indices(&mut self) -> Result<(), StoreError> {
        let state = LogState::scan(&self.base)?;
        self.hash_index = state.hash_index;
        self.levels = state.levels;
        self.rfds = state.rfds;
        self.wfd = state.wfd;
        self.wfd_offset = 0;
        self.counter = 0;
        Ok(())
    }

    /// Run count at which a level is merged into the next.
    ///
    /// At the minimum `max_runs_per_level` of 1 the trigger stays at 2:
    /// merging a lone run would only relocate it, one level deeper each
    /// time.
    fn merge_trigger(&self) -> usize {
        self.max_runs_per_level.max(2)
    }

    /// Seals the active file: replicates it, counts it as a run, merges
    /// level 0 if it filled up, and (unless `reopen` is false) starts a
    /// fresh active file.
    fn seal_active(&mut self, reopen: bool) -> Result<(), StoreError> {
        let sealed = self.levels[0];
        if let Some(replica) = self.base.replica.as_mut() {
            replica.put(&format!("L0.{sealed}.run"))?;
        }
        self.levels[0] += 1;
        debug!(run = sealed, bytes = self.wfd_offset, "sealed active run");

        if self.levels[0] >= self.merge_trigger() {
            self.merge(0)?;
        }

        if reopen {
            let active = self.levels[0];
            let active_path = self.base.run_path(0, active);
            self.wfd = File::create(&active_path)?;
            self.wfd_offset = 0;
            self.rfds[0].push(File::open(&active_path)?);
        }
        Ok(())
    }

    /// Copies every record the index still references from `level` into
    /// a single run at `level + 1`, rewriting the index as it goes, then
    /// deletes the sources and cascades if the next level filled up.
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
        let mut writer = std::io::BufWriter::new(File::create(&out_path)?);
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
                if self.hash_index.get(&key) == Some(&current) {
                    let new_offset = dst_offset;
                    dst_offset += codec.write_record(&mut writer, &key, &value)?;
                    self.hash_index.insert(
                        key,
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
        // Close stale read handles before unlinking the files under them.
        self.rfds[level].clear();
        for run in 0..n_inputs {
            fs::remove_file(self.base.run_path(level, run))?;
        }
        self.levels[level] = 0;
        self.levels[level + 1] += 1;
        info!(
            level,
            merged = n_inputs,
            out_run = next_run,
            bytes = dst_offset,
            "merge complete"
        );

        if let Some(replica) = self.base.replica.as_mut() {
            let l = level + 1;
            replica.put(&format!("L{l}.{next_run}.run"))?;
        }

        if self.levels[level + 1] >= self.merge_trigger() {
            self.merge(level + 1)?;
        }
        Ok(())
    }
}

impl KvStore for AppendLog {
    fn get(&mut self, key: &[u8]) -> Result<Vec<u8>, StoreError> {
        self.base.check_key(key)?;

        let Some(&rec) = self.hash_index.get(key) else {
            return Ok(Vec::new());
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

        // A tombstone only drops the index entry; nothing hits the disk.
        if value.is_empty() {
            self.hash_index.remove(key);
            return Ok(());
        }

        let offset = self.wfd_offset;
        self.wfd_offset += self.base.codec.write_record(&mut self.wfd, key, value)?;
        self.hash_index.insert(
            key.to_vec(),
            RunRecord {
                level: 0,
                run: self.levels[0],
                offset,
            },
        );
        self.counter += (key.len() + value.len()) as u64;

        if self.counter >= self.threshold {
            self.counter = 0;
            self.seal_active(true)?;
        }
        Ok(())
    }

    fn snapshot(&mut self) -> Result<(), StoreError> {
        if self.wfd_offset == 0 {
            return Ok(());
        }
        self.counter = 0;
        self.seal_active(true)
    }

    fn restore(&mut self, version: Option<u64>) -> Result<bool, StoreError> {
        // Seal pending writes so they are part of the replica's state.
        self.snapshot()?;

        // Slot expansion must use the trigger the merges actually ran
        // at: with max_runs_per_level = 1 the level cycling period is 2,
        // and expanding in base 1 would never request a merged run.
        let max_per_level = self.merge_trigger() as u64;
        let Some(replica) = self.base.replica.as_mut() else {
            return Ok(false);
        };
        let restored = replica.restore(max_per_level, version)?;
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
        if self.wfd_offset > 0 {
            // Seal without reopening; the store is going away.
            self.seal_active(false)?;
        } else {
            // Drop the read handle on the empty active file, then remove
            // the file so it is not miscounted as a run on reopen.
            if let Some(fds) = self.rfds.first_mut() {
                fds.pop();
            }
            fs::remove_file(self.base.run_path(0, self.levels[0]))?;
        }
        self.base.save_metadata()?;
        self.rfds.clear();
        self.base.sync_dir()
    }
}
