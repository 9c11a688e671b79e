//! Local-directory replica backend.

use std::fs;
use std::path::{Path, PathBuf};
use std::thread::sleep;
use std::time::Duration;

use tracing::{debug, info, trace};

use super::{
    RESTORE_EXTENSIONS, Replica, ReplicaError, VersionLedger, format_file_name, parse_file_name,
    plan_restore,
};

/// Replica backed by a directory on the local filesystem.
///
/// Useful on its own (a mounted backup volume) and as the test double for
/// the object-store backend. An optional per-byte latency simulates a
/// network transport for benchmarking and tests.
pub struct PathReplica {
    src_dir: PathBuf,
    remote_dir: PathBuf,
    ledger: VersionLedger,
    latency_nanos_per_byte: u64,
}

impl PathReplica {
    /// Opens a replica copying between `src_dir` and `remote_dir`,
    /// creating the remote directory if needed and scanning it for
    /// existing versions.
    pub fn open(
        src_dir: impl AsRef<Path>,
        remote_dir: impl AsRef<Path>,
    ) -> Result<Self, ReplicaError> {
        let remote_dir = remote_dir.as_ref().to_path_buf();
        fs::create_dir_all(&remote_dir)?;

        let mut ledger = VersionLedger::default();
        for entry in fs::read_dir(&remote_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name();
            match name.to_str().map(parse_file_name) {
                Some(Ok(parsed)) => ledger.observe(&parsed),
                _ => trace!(name = ?name, "ignoring foreign file in remote dir"),
            }
        }

        Ok(Self {
            src_dir: src_dir.as_ref().to_path_buf(),
            remote_dir,
            ledger,
            latency_nanos_per_byte: 0,
        })
    }

    /// Adds a simulated transfer latency proportional to file size.
    pub fn with_simulated_latency(mut self, nanos_per_byte: u64) -> Self {
        self.latency_nanos_per_byte = nanos_per_byte;
        self
    }

    fn simulate_transfer(&self, path: &Path) {
        if self.latency_nanos_per_byte == 0 {
            return;
        }
        if let Ok(meta) = fs::metadata(path) {
            sleep(Duration::from_nanos(
                self.latency_nanos_per_byte.saturating_mul(meta.len()),
            ));
        }
    }
}

impl Replica for PathReplica {
    fn put(&mut self, filename: &str) -> Result<(), ReplicaError> {
        let remote_name = self.ledger.on_put(filename)?;
        let src = self.src_dir.join(filename);
        self.simulate_transfer(&src);
        fs::copy(&src, self.remote_dir.join(&remote_name))?;
        debug!(file = filename, as_object = %remote_name, "replicated file");
        Ok(())
    }

    fn get(&mut self, filename: &str, version: Option<u64>) -> Result<bool, ReplicaError> {
        let parsed = parse_file_name(filename)?;
        let Some(version) = version.or_else(|| self.ledger.latest_for(parsed.level, parsed.run))
        else {
            return Ok(false);
        };

        let remote_name = format_file_name(parsed.level, parsed.run, &parsed.ext, Some(version));
        let remote_path = self.remote_dir.join(&remote_name);
        if !remote_path.is_file() {
            return Ok(false);
        }

        self.simulate_transfer(&remote_path);
        fs::copy(&remote_path, self.src_dir.join(filename))?;
        trace!(file = filename, version, "fetched file");
        Ok(true)
    }

    fn restore(&mut self, max_per_level: u64, version: Option<u64>) -> Result<bool, ReplicaError> {
        let remote_dir = self.remote_dir.clone();
        let Some(plan) = plan_restore(&self.ledger, max_per_level, version, |name| {
            remote_dir.join(name).is_file()
        }) else {
            return Ok(false);
        };

        // Snapshot verified; only now is the local tree replaced.
        fs::remove_dir_all(&self.src_dir)?;
        fs::create_dir_all(&self.src_dir)?;

        for item in &plan {
            for ext in RESTORE_EXTENSIONS {
                let name = format_file_name(item.level, item.run, ext, None);
                self.get(&name, Some(item.version))?;
            }
        }
        info!(
            version = version.unwrap_or_else(|| self.ledger.global_version()),
            slots = plan.len(),
            "restored snapshot"
        );
        Ok(true)
    }

    fn gc(&mut self) -> Result<(), ReplicaError> {
        let mut removed = 0usize;
        for entry in fs::read_dir(&self.remote_dir)? {
            let entry = entry?;
            if !entry.file_type()?.is_file() {
                continue;
            }
            let name = entry.file_name();
            let Some(Ok(parsed)) = name.to_str().map(parse_file_name) else {
                continue;
            };
            if self.ledger.latest_for(parsed.level, parsed.run) != Some(parsed.version) {
                fs::remove_file(entry.path())?;
                removed += 1;
            }
        }
        debug!(removed, "garbage-collected stale versions");
        Ok(())
    }

    fn destroy(&mut self) -> Result<(), ReplicaError> {
        match fs::remove_dir_all(&self.remote_dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    fn global_version(&self) -> u64 {
        self.ledger.global_version()
    }
}
