//! Object-store replica backend over a pluggable client.

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, info, trace};

use super::{
    RESTORE_EXTENSIONS, Replica, ReplicaError, VersionLedger, format_file_name, parse_file_name,
    plan_restore,
};

/// Minimal client interface to a flat object namespace (one bucket).
///
/// The concrete client (an S3-compatible SDK, a fake, ...) is injected
/// into [`ObjectReplica`]; the replica owns all naming and versioning.
pub trait ObjectStore {
    /// Names of all objects in the namespace.
    fn list(&self) -> Result<Vec<String>, ReplicaError>;

    /// Stores `data` under `name`, replacing any existing object.
    fn put(&mut self, name: &str, data: &[u8]) -> Result<(), ReplicaError>;

    /// Contents of `name`, or `None` if absent.
    fn get(&self, name: &str) -> Result<Option<Vec<u8>>, ReplicaError>;

    /// Removes `name` if present.
    fn remove(&mut self, name: &str) -> Result<(), ReplicaError>;

    /// Existence check.
    fn contains(&self, name: &str) -> Result<bool, ReplicaError> {
        Ok(self.get(name)?.is_some())
    }
}

/// Replica backed by an [`ObjectStore`] client.
pub struct ObjectReplica<S: ObjectStore> {
    src_dir: PathBuf,
    store: S,
    ledger: VersionLedger,
}

impl<S: ObjectStore> ObjectReplica<S> {
    /// Opens a replica over `store`, scanning existing objects to rebuild
    /// the version ledger.
    pub fn open(src_dir: impl AsRef<Path>, store: S) -> Result<Self, ReplicaError> {
        let mut ledger = VersionLedger::default();
        for name in store.list()? {
            match parse_file_name(&name) {
                Ok(parsed) => ledger.observe(&parsed),
                Err(_) => trace!(name, "ignoring foreign object"),
            }
        }
        Ok(Self {
            src_dir: src_dir.as_ref().to_path_buf(),
            store,
            ledger,
        })
    }

    /// The underlying client, for inspection in tests.
    pub fn store(&self) -> &S {
        &self.store
    }
}

impl<S: ObjectStore> Replica for ObjectReplica<S> {
    fn put(&mut self, filename: &str) -> Result<(), ReplicaError> {
        let remote_name = self.ledger.on_put(filename)?;
        let data = fs::read(self.src_dir.join(filename))?;
        self.store.put(&remote_name, &data)?;
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
        let Some(data) = self.store.get(&remote_name)? else {
            return Ok(false);
        };
        fs::write(self.src_dir.join(filename), data)?;
        trace!(file = filename, version, "fetched object");
        Ok(true)
    }

    fn restore(&mut self, max_per_level: u64, version: Option<u64>) -> Result<bool, ReplicaError> {
        let store = &self.store;
        let Some(plan) = plan_restore(&self.ledger, max_per_level, version, |name| {
            store.contains(name).unwrap_or(false)
        }) else {
            return Ok(false);
        };

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
        for name in self.store.list()? {
            let Ok(parsed) = parse_file_name(&name) else {
                continue;
            };
            if self.ledger.latest_for(parsed.level, parsed.run) != Some(parsed.version) {
                self.store.remove(&name)?;
                removed += 1;
            }
        }
        debug!(removed, "garbage-collected stale versions");
        Ok(())
    }

    fn destroy(&mut self) -> Result<(), ReplicaError> {
        for name in self.store.list()? {
            self.store.remove(&name)?;
        }
        Ok(())
    }

    fn global_version(&self) -> u64 {
        self.ledger.global_version()
    }
}

/// In-memory [`ObjectStore`]: the reference client used by the test
/// suite, standing in for a real object-store SDK.
#[derive(Debug, Default)]
pub struct MemoryObjectStore {
    objects: HashMap<String, Vec<u8>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored objects.
    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }
}

impl ObjectStore for MemoryObjectStore {
    fn list(&self) -> Result<Vec<String>, ReplicaError> {
        Ok(self.objects.keys().cloned().collect())
    }

    fn put(&mut self, name: &str, data: &[u8]) -> Result<(), ReplicaError> {
        self.objects.insert(name.to_string(), data.to_vec());
        Ok(())
    }

    fn get(&self, name: &str) -> Result<Option<Vec<u8>>, ReplicaError> {
        Ok(self.objects.get(name).cloned())
    }

    fn remove(&mut self, name: &str) -> Result<(), ReplicaError> {
        self.objects.remove(name);
        Ok(())
    }

    fn contains(&self, name: &str) -> Result<bool, ReplicaError> {
        Ok(self.objects.contains_key(name))
    }
}
