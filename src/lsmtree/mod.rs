//! Size-tiered LSM tree engine (write-optimized).
//!
//! ## Design Overview
//!
//! Writes land in a sorted in-memory memtable mirrored by a write-ahead
//! log. When the memtable's byte budget overflows it is flushed, in key
//! order, into an immutable level-0 run with two sidecars: a bloom filter
//! sized for a 1% false positive rate and fence pointers sampling one key
//! per `density_factor` records. When a level fills up to
//! `max_runs_per_level` runs, all of its runs are k-way merged into a
//! single run on the next level, cascading as deeper levels fill.
//!
//! Reads check the memtable, then every level from the top, runs newest
//! first. A run is only touched when its bloom filter admits the key; the
//! fence pointers then bound the scan to at most `density_factor` records.
//!
//! ## Merge semantics
//!
//! The merge keeps an active front of one record per input run. The
//! smallest key wins; on equal keys the run with the larger index (the
//! newer run) wins and older duplicates are skipped. Tombstones (empty
//! values) are dropped from the output entirely.
//!
//! ## Failure model
//!
//! - Memtable loss after a crash is bounded by the WAL, which replays
//!   into the memtable on open and is truncated on flush.
//! - A crash mid-merge leaves the source runs intact: the output run and
//!   its sidecars are fully written before any source file is unlinked.
//! - A torn trailing WAL record is dropped on replay.
//!
//! With a replica attached, every sealed run (and its sidecars) is pushed
//! after flush and merge, `snapshot` forces a flush, and `restore`
//! rebuilds the directory from a replicated snapshot version.

#[cfg(test)]
mod tests;

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Seek, SeekFrom};
use std::path::PathBuf;

use tracing::{debug, info};

use crate::bloom::BloomFilter;
use crate::fence::FencePointers;
use crate::replica::Replica;
use crate::store::{
    DEFAULT_MAX_KEY_LEN, DEFAULT_MAX_VALUE_LEN, EngineType, KvStore, StoreBase, StoreError,
};

/// Configuration for [`LsmTree::open`].
pub struct LsmTreeConfig {
    /// Maximum key length in bytes.
    pub max_key_len: usize,

    /// Maximum value length in bytes.
    pub max_value_len: usize,

    /// Runs a level may accumulate before it is merged into the next
    /// level. Must be at least 2.
    pub max_runs_per_level: usize,

    /// Fence pointer sampling period, and the scan budget per lookup.
    pub density_factor: usize,

    /// Memtable byte budget. The budget is soft by at most one record:
    /// the record that overflows it is included in the flush.
    pub memtable_bytes_limit: usize,

    /// Optional replica receiving sealed runs.
    pub replica: Option<Box<dyn Replica>>,
}

impl Default for LsmTreeConfig {
    fn default() -> Self {
        Self {
            max_key_len: DEFAULT_MAX_KEY_LEN,
            max_value_len: DEFAULT_MAX_VALUE_LEN,
            max_runs_per_level: 3,
            density_factor: 20,
            memtable_bytes_limit: 1_000_000,
            replica: None,
        }
    }
}

/// An immutable on-disk run's in-memory face: its bloom filter and fence
/// pointers. The record data stays on disk behind a retained read handle.
struct Run {
    filter: BloomFilter,
    pointers: FencePointers,
}

/// Size-tiered LSM tree over a data directory.
pub struct LsmTree {
    base: StoreBase,
    max_runs_per_level: usize,
    density_factor: usize,

    memtable: BTreeMap<Vec<u8>, Vec<u8>>,
    memtable_bytes_limit: usize,
    memtable_bytes: usize,
    wal_file: File,

    /// Per level, the runs in creation order (older first).
    levels: Vec<Vec<Run>>,
    /// Retained read handles, parallel to `levels`.
    rfds: Vec<Vec<File>>,
}

impl LsmTree {
    /// Opens (or creates) an LSM tree rooted at `data_dir`.
    ///
    /// Replays the WAL into the memtable, then either syncs from the
    /// replica (when one is attached) or rebuilds run indices from the
    /// local directory.
    pub fn open(data_dir: impl Into<PathBuf>, config: LsmTreeConfig) -> Result<Self, StoreError> {
        if config.max_runs_per_level < 2 {
            return Err(StoreError::InvalidConfig(
                "max_runs_per_level must be at least 2".into(),
            ));
        }
        if config.density_factor == 0 {
            return Err(StoreError::InvalidConfig(
                "density_factor must be > 0".into(),
            ));
        }
        if config.memtable_bytes_limit == 0 {
            return Err(StoreError::InvalidConfig(
                "memtable_bytes_limit must be > 0".into(),
            ));
        }

        let base = StoreBase::open(
            data_dir.into(),
            config.max_key_len,
            config.max_value_len,
            EngineType::LsmTree,
            config.replica,
        )?;

        // Replay the WAL into the memtable; a torn trailing record reads
        // as EOF and is dropped.
        let wal_path = base.data_dir.join("wal");
        let mut memtable = BTreeMap::new();
        let mut memtable_bytes = 0usize;
        if wal_path.is_file() {
            let mut wal = File::open(&wal_path)?;
            while let Some((key, value)) = base.codec.read_record(&mut wal)? {
                memtable_bytes += key.len() + value.len();
                memtable.insert(key, value);
            }
            debug!(records = memtable.len(), "replayed write-ahead log");
        }
        let wal_file = OpenOptions::new().create(true).append(true).open(&wal_path)?;

        let mut tree = Self {
            base,
            max_runs_per_level: config.max_runs_per_level,
            density_factor: config.density_factor,
            memtable,
            memtable_bytes_limit: config.memtable_bytes_limit,
            memtable_bytes,
            wal_file,
            levels: Vec::new(),
            rfds: Vec::new(),
        };

        // Indices must exist before the replica sync: the flush inside
        // `restore` needs the real level-0 run count to pick a fresh run
        // index instead of clobbering an existing run.
        tree.rebuild_indices()?;
        if tree.base.replica.is_some() {
            tree.restore(None)?;
        }
        Ok(tree)
    }

    /// Reloads run metadata (filters, pointers, read handles) from the
    /// data directory. Corrupt or missing sidecars refuse the run.
    fn rebuild_indices(&mut self) -> Result<(), StoreError> {
        self.levels.clear();
        self.rfds.clear();

        let counts = self.base.discover_levels()?;
        for (level, &n_runs) in counts.iter().enumerate() {
            let mut runs = Vec::with_capacity(n_runs);
            let mut fds = Vec::with_capacity(n_runs);
            for run in 0..n_runs {
                let pointers =
                    FencePointers::deserialize(&fs::read_to_string(self.base.pointers_path(level, run))?)?;
                let filter =
                    BloomFilter::deserialize(&fs::read_to_string(self.base.filter_path(level, run))?)?;
                fds.push(File::open(self.base.run_path(level, run))?);
                runs.push(Run { filter, pointers });
            }
            self.levels.push(runs);
            self.rfds.push(fds);
        }
        debug!(levels = ?counts, "rebuilt run indices");
        Ok(())
    }

    /// Serializes the memtable into a new level-0 run with its sidecars,
    /// truncates the WAL, and merges level 0 if it filled up.
    fn flush(&mut self) -> Result<(), StoreError> {
        if self.memtable.is_empty() {
            return Ok(());
        }
        if self.levels.is_empty() {
            self.levels.push(Vec::new());
            self.rfds.push(Vec::new());
        }

        let run_idx = self.levels[0].len();
        let run_path = self.base.run_path(0, run_idx);
        let codec = self.base.codec;

        let mut pointers = FencePointers::new(self.density_factor);
        let mut filter = BloomFilter::new(self.memtable.len() as u64);
        let records = self.memtable.len();

        let mut writer = BufWriter::new(File::create(&run_path)?);
        let mut offset = 0u64;
        for (key, value) in std::mem::take(&mut self.memtable) {
            pointers.add(&key, offset);
            offset += codec.write_record(&mut writer, &key, &value)?;
            filter.add(&key);
        }
        let file = writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;
        self.memtable_bytes = 0;

        fs::write(self.base.pointers_path(0, run_idx), pointers.serialize()?)?;
        fs::write(self.base.filter_path(0, run_idx), filter.serialize()?)?;

        self.rfds[0].push(File::open(&run_path)?);
        self.levels[0].push(Run { filter, pointers });
        debug!(records, run = run_idx, bytes = offset, "flushed memtable");

        if let Some(replica) = self.base.replica.as_mut() {
            replica.put(&format!("L0.{run_idx}.run"))?;
            replica.put(&format!("L0.{run_idx}.pointers"))?;
            replica.put(&format!("L0.{run_idx}.filter"))?;
        }

        // Truncate the WAL: its records now live in the run.
        self.wal_file = File::create(self.base.data_dir.join("wal"))?;

        if self.levels[0].len() >= self.max_runs_per_level {
            self.merge(0)?;
        }
        Ok(())
    }

    /// K-way merges every run at `level` into a single new run at
    /// `level + 1`, then cascades if that level filled up.
    fn merge(&mut self, level: usize) -> Result<(), StoreError> {
        let n_inputs = self.levels[level].len();
        info!(level, runs = n_inputs, "merging level");

        if level + 1 >= self.levels.len() {
            self.levels.push(Vec::new());
            self.rfds.push(Vec::new());
        }
        let next_run = self.levels[level + 1].len();
        let codec = self.base.codec;

        // Size the output filter from the input estimates.
        let estimate: u64 = self.levels[level]
            .iter()
            .map(|run| run.filter.est_num_items())
            .sum();
        let mut filter = BloomFilter::new(estimate);
        let mut pointers = FencePointers::new(self.density_factor);

        // Active front: one pending record per input run.
        let mut fronts: Vec<Option<(Vec<u8>, Vec<u8>)>> = Vec::with_capacity(n_inputs);
        for i in 0..n_inputs {
            let fd = &mut self.rfds[level][i];
            fd.seek(SeekFrom::Start(0))?;
            fronts.push(codec.read_record(fd)?);
        }

        let out_path = self.base.run_path(level + 1, next_run);
        let mut writer = BufWriter::new(File::create(&out_path)?);
        let mut offset = 0u64;

        loop {
            // Smallest key wins; on ties the larger run index (newer run)
            // wins because later candidates replace on equality.
            let winner = fronts
                .iter()
                .enumerate()
                .filter_map(|(i, front)| front.as_ref().map(|(key, _)| (i, key)))
                .reduce(|best, cand| if cand.1 <= best.1 { cand } else { best })
                .map(|(i, _)| i);
            let Some(widx) = winner else { break };
            let Some((key, value)) = fronts[widx].take() else {
                break;
            };

            // Tombstones are dropped from the output at every level.
            if !value.is_empty() {
                pointers.add(&key, offset);
                offset += codec.write_record(&mut writer, &key, &value)?;
                filter.add(&key);
            }

            // Advance the winner, then skip the losing duplicates in the
            // winner's run and every older one.
            let fd = &mut self.rfds[level][widx];
            fronts[widx] = codec.read_record(fd)?;
            for i in 0..=widx {
                while matches!(&fronts[i], Some((k, _)) if *k == key) {
                    let fd = &mut self.rfds[level][i];
                    fronts[i] = codec.read_record(fd)?;
                }
            }
        }

        let file = writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_all()?;

        // Sidecars are written before any source file is unlinked, so a
        // crash in between leaves a recoverable directory.
        fs::write(
            self.base.pointers_path(level + 1, next_run),
            pointers.serialize()?,
        )?;
        fs::write(
            self.base.filter_path(level + 1, next_run),
            filter.serialize()?,
        )?;

        self.rfds[level + 1].push(File::open(&out_path)?);
        // Close stale read handles before unlinking the files under them.
        self.rfds[level].clear();
        for run in 0..n_inputs {
            fs::remove_file(self.base.run_path(level, run))?;
            fs::remove_file(self.base.pointers_path(level, run))?;
            fs::remove_file(self.base.filter_path(level, run))?;
        }
        self.levels[level].clear();
        self.levels[level + 1].push(Run { filter, pointers });
        info!(
            level,
            merged = n_inputs,
            out_run = next_run,
            bytes = offset,
            "merge complete"
        );

        if let Some(replica) = self.base.replica.as_mut() {
            let l = level + 1;
            replica.put(&format!("L{l}.{next_run}.run"))?;
            replica.put(&format!("L{l}.{next_run}.pointers"))?;
            replica.put(&format!("L{l}.{next_run}.filter"))?;
        }

        if self.levels[level + 1].len() >= self.max_runs_per_level {
            self.merge(level + 1)?;
        }
        Ok(())
    }
}

impl KvStore for LsmTree {
    fn get(&mut self, key: &[u8]) -> Result<Vec<u8>, StoreError> {
        self.base.check_key(key)?;

        if let Some(value) = self.memtable.get(key) {
            return Ok(value.clone());
        }

        let codec = self.base.codec;
        for (level_idx, level) in self.levels.iter().enumerate() {
            for (run_idx, run) in level.iter().enumerate().rev() {
                if !run.filter.contains(key) {
                    continue;
                }
                let Some(offset) = run.pointers.lookup(key) else {
                    continue;
                };
                let fd = &mut self.rfds[level_idx][run_idx];
                fd.seek(SeekFrom::Start(offset))?;
                for _ in 0..run.pointers.density_factor() {
                    match codec.read_record(fd)? {
                        Some((read_key, read_value)) => {
                            if read_key == key {
                                return Ok(read_value);
                            }
                        }
                        None => break,
                    }
                }
            }
        }
        Ok(Vec::new())
    }

    fn set(&mut self, key: &[u8], value: &[u8]) -> Result<(), StoreError> {
        self.base.check_key(key)?;
        self.base.check_value(value)?;

        self.memtable.insert(key.to_vec(), value.to_vec());
        let new_bytes = self.memtable_bytes + key.len() + value.len();

        if new_bytes > self.memtable_bytes_limit {
            // The overflowing record rides along in the flush, so the WAL
            // write is skipped: WAL records always mirror memtable
            // residents.
            self.flush()?;
        } else {
            self.base.codec.write_record(&mut self.wal_file, key, value)?;
            self.memtable_bytes = new_bytes;
        }
        Ok(())
    }

    fn snapshot(&mut self) -> Result<(), StoreError> {
        self.flush()
    }

    fn restore(&mut self, version: Option<u64>) -> Result<bool, StoreError> {
        // Flush first so pending writes are part of the replica's state.
        self.flush()?;

        let Some(replica) = self.base.replica.as_mut() else {
            return Ok(false);
        };
        let restored = replica.restore(self.max_runs_per_level as u64, version)?;

        if restored {
            // The replica wiped the directory: re-tag it, reopen the WAL
            // handle (which now points at an unlinked file), and rebuild
            // the run indices from the fetched files. On refusal the
            // current local state is untouched and stays authoritative.
            self.base.save_metadata()?;
            self.wal_file = OpenOptions::new()
                .create(true)
                .append(true)
                .open(self.base.data_dir.join("wal"))?;
            self.rebuild_indices()?;
        }
        Ok(restored)
    }

    fn close(&mut self) -> Result<(), StoreError> {
        self.base.save_metadata()?;
        if self.base.replica.is_some() {
            self.snapshot()?;
        }
        self.rfds.clear();
        self.base.sync_dir()
    }
}
