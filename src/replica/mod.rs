//! Snapshot replication of run files to an external store.
//!
//! ## Design Overview
//!
//! A replica mirrors an engine's run files (and their sidecars) into a
//! remote namespace, versioning each `(level, run)` slot independently:
//!
//! - Remote object names are `L{level}.{run}.{ext}-{version}`; a name
//!   without the `-{version}` suffix is version 0 (pre-existing objects).
//! - Putting a `.run` file bumps its slot's version; sidecar puts reuse
//!   the slot's current version, so a run and its sidecars always share
//!   one version number (engines put the run first).
//! - Putting a **level-0** `.run` file also bumps the **global version**,
//!   which therefore counts the engine's flushes/seals and names an
//!   engine-wide snapshot.
//!
//! ## Snapshot arithmetic
//!
//! Because every level holds fewer than `max_per_level` runs after any
//! completed operation, and merges fire deterministically when a level
//! fills, the set of live slots at global version `V` is just `V` written
//! in base `max_per_level`: digit `d_i` contributes slots
//! `(i, 0) .. (i, d_i - 1)` ([`expand_version`]). The same determinism
//! yields, for each slot, how many times it had been put by the time the
//! global counter reached `V`, which [`VersionLedger::version_as_of`]
//! uses to fetch the slot content that was current at that snapshot
//! rather than whatever is newest.
//!
//! ## Backends
//!
//! - [`PathReplica`]: a local directory, with optional simulated network
//!   latency proportional to file size.
//! - [`ObjectReplica`]: any client implementing the [`ObjectStore`]
//!   interface; [`MemoryObjectStore`] ships as the reference client.


mod object;
mod path;

pub use object::{MemoryObjectStore, ObjectReplica, ObjectStore};
pub use path::PathReplica;

use std::collections::HashMap;
use std::io;

use thiserror::Error;

/// Errors surfaced by replica operations.
#[derive(Debug, Error)]
pub enum ReplicaError {
    /// Underlying I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// A file name did not follow the `L{level}.{run}.{ext}[-{version}]`
    /// scheme.
    #[error("malformed replica file name: {0:?}")]
    InvalidName(String),
}

/// External store receiving per-slot versioned copies of run files.
///
/// Engines drive replicas through this trait only; a replica never calls
/// back into an engine. `put`/`get` move single files, `restore` rebuilds
/// the whole data directory for a snapshot, `gc` drops superseded
/// versions, `destroy` removes the remote namespace.
pub trait Replica {
    /// Copies `filename` (relative to the source directory) to the remote
    /// store under the slot's next version.
    fn put(&mut self, filename: &str) -> Result<(), ReplicaError>;

    /// Copies `filename` back from the remote store at `version` (latest
    /// when `None`). Returns `false` if the object does not exist.
    fn get(&mut self, filename: &str, version: Option<u64>) -> Result<bool, ReplicaError>;

    /// Restores the source directory to the snapshot named by `version`
    /// (the current global version when `None`).
    ///
    /// Returns `false`, leaving local files untouched, when the snapshot
    /// cannot be resolved: version 0 (nothing was ever replicated), an
    /// unknown slot, or a garbage-collected slot version.
    fn restore(&mut self, max_per_level: u64, version: Option<u64>) -> Result<bool, ReplicaError>;

    /// Removes every remote object whose version is not the latest for
    /// its slot.
    fn gc(&mut self) -> Result<(), ReplicaError>;

    /// Removes the remote namespace entirely.
    fn destroy(&mut self) -> Result<(), ReplicaError>;

    /// Current global version (number of level-0 run puts observed).
    fn global_version(&self) -> u64;
}

// ------------------------------------------------------------------------------------------------
// Remote name scheme
// ------------------------------------------------------------------------------------------------

/// A parsed remote (or local) run-file name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct RemoteName {
    pub level: usize,
    pub run: usize,
    pub ext: String,
    pub version: u64,
}

/// Parses `L{level}.{run}.{ext}[-{version}]`.
pub(crate) fn parse_file_name(name: &str) -> Result<RemoteName, ReplicaError> {
    let invalid = || ReplicaError::InvalidName(name.to_string());

    let (stem, version) = match name.split_once('-') {
        Some((stem, version)) => (stem, version.parse::<u64>().map_err(|_| invalid())?),
        None => (name, 0),
    };
    let stem = stem.strip_prefix('L').ok_or_else(invalid)?;

    let mut parts = stem.splitn(3, '.');
    let level = parts
        .next()
        .and_then(|s| s.parse::<usize>().ok())
        .ok_or_else(invalid)?;
    let run = parts
        .next()
        .and_then(|s| s.parse::<usize>().ok())
        .ok_or_else(invalid)?;
    let ext = parts.next().ok_or_else(invalid)?.to_string();
    if ext.is_empty() {
        return Err(invalid());
    }

    Ok(RemoteName {
        level,
        run,
        ext,
        version,
    })
}

/// Formats `L{level}.{run}.{ext}` with an optional `-{version}` suffix.
pub(crate) fn format_file_name(level: usize, run: usize, ext: &str, version: Option<u64>) -> String {
    match version {
        Some(v) => format!("L{level}.{run}.{ext}-{v}"),
        None => format!("L{level}.{run}.{ext}"),
    }
}

// ------------------------------------------------------------------------------------------------
// Snapshot expansion
// ------------------------------------------------------------------------------------------------

/// Live `(level, run)` slots at global version `version`, with
/// `max_per_level` runs per level: the base-`max_per_level` digits of
/// `version`, digit `d_i` contributing `(i, d_i - 1) .. (i, 0)`.
///
/// `max_per_level == 1` degenerates to the single slot `(0, 0)`.
pub fn expand_version(version: u64, max_per_level: u64) -> Vec<(usize, usize)> {
    if max_per_level == 1 {
        return vec![(0, 0)];
    }

    let mut digits = Vec::new();
    let mut v = version;
    while v != 0 {
        digits.push(v % max_per_level);
        v /= max_per_level;
    }

    let mut slots = Vec::new();
    for (level, &digit) in digits.iter().enumerate() {
        for run in (0..digit as usize).rev() {
            slots.push((level, run));
        }
    }
    slots
}

// ------------------------------------------------------------------------------------------------
// Version bookkeeping shared by both backends
// ------------------------------------------------------------------------------------------------

/// Tracks the latest version per slot and the global version.
#[derive(Debug, Default)]
pub(crate) struct VersionLedger {
    global_version: u64,
    latest: HashMap<(usize, usize), u64>,
}

impl VersionLedger {
    /// Folds one pre-existing remote object into the ledger (initial
    /// scan of the remote namespace).
    pub fn observe(&mut self, name: &RemoteName) {
        if name.ext == "run" && name.level == 0 {
            self.global_version += 1;
        }
        let slot = self.latest.entry((name.level, name.run)).or_insert(0);
        *slot = (*slot).max(name.version);
    }

    /// Registers a local-file put and returns the versioned remote name
    /// to store it under.
    pub fn on_put(&mut self, name: &str) -> Result<String, ReplicaError> {
        let parsed = parse_file_name(name)?;
        if parsed.ext == "run" {
            if parsed.level == 0 {
                self.global_version += 1;
            }
            *self.latest.entry((parsed.level, parsed.run)).or_insert(0) += 1;
        }
        let version = self
            .latest
            .get(&(parsed.level, parsed.run))
            .copied()
            .unwrap_or(0);
        Ok(format_file_name(
            parsed.level,
            parsed.run,
            &parsed.ext,
            Some(version),
        ))
    }

    /// Latest known version for a slot.
    pub fn latest_for(&self, level: usize, run: usize) -> Option<u64> {
        self.latest.get(&(level, run)).copied()
    }

    /// Current global version.
    pub fn global_version(&self) -> u64 {
        self.global_version
    }

    /// The version slot `(level, run)` carried when the global version
    /// was `as_of`, or `None` if the slot is unknown or the arithmetic
    /// says it had not been written yet.
    ///
    /// Derived by put-counting: the slot is put once each time the global
    /// counter's digit at position `level` climbs past `run`, so the
    /// number of puts up to `v` is closed-form; the wanted version is the
    /// latest minus the puts that happened after `as_of`.
    pub fn version_as_of(
        &self,
        level: usize,
        run: usize,
        as_of: u64,
        max_per_level: u64,
    ) -> Option<u64> {
        let latest = self.latest_for(level, run)?;
        let newer = puts_up_to(level, run, self.global_version, max_per_level)
            .checked_sub(puts_up_to(level, run, as_of, max_per_level))?;
        latest.checked_sub(newer)
    }
}

/// Number of times slot `(level, run)` has been put by the time the
/// global version reached `v`.
fn puts_up_to(level: usize, run: usize, v: u64, max_per_level: u64) -> u64 {
    let m = max_per_level.max(1) as u128;
    let m_level = m.pow(level as u32);
    let first = (run as u128 + 1) * m_level;
    if (v as u128) < first {
        0
    } else {
        (((v as u128) - first) / (m_level * m) + 1) as u64
    }
}

/// One slot of a restore plan: fetch `(level, run)` at `version`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct RestoreItem {
    pub level: usize,
    pub run: usize,
    pub version: u64,
}

/// Resolves the slot set and per-slot versions for restoring global
/// version `version` (current when `None`). Returns `None` when the
/// snapshot cannot be served: version 0, an unknown slot, or a slot
/// whose as-of version is gone (`exists` is consulted for the run file).
pub(crate) fn plan_restore(
    ledger: &VersionLedger,
    max_per_level: u64,
    version: Option<u64>,
    mut exists: impl FnMut(&str) -> bool,
) -> Option<Vec<RestoreItem>> {
    let v = version.unwrap_or_else(|| ledger.global_version());
    if v == 0 {
        return None;
    }

    let mut plan = Vec::new();
    for (level, run) in expand_version(v, max_per_level) {
        let slot_version = ledger.version_as_of(level, run, v, max_per_level)?;
        if !exists(&format_file_name(level, run, "run", Some(slot_version))) {
            return None;
        }
        plan.push(RestoreItem {
            level,
            run,
            version: slot_version,
        });
    }
    Some(plan)
}

/// Sidecar extensions fetched alongside each restored run. Engines
/// without sidecars simply have nothing stored under these names.
pub(crate) const RESTORE_EXTENSIONS: [&str; 3] = ["run", "filter", "pointers"];
