//! # tierkv
//!
//! An embeddable key-value storage library offering three disk-resident
//! engines that share one contract but trade writes against reads
//! differently, plus a trivial in-memory engine:
//!
//! | Engine | Shape | Sweet spot |
//! |--------|-------|------------|
//! | [`LsmTree`] | sorted runs, bloom filters, fence pointers | write-heavy, point lookups |
//! | [`HybridLog`] | in-memory ring over insertion-ordered runs | hot working sets |
//! | [`AppendLog`] | hash index over append-only runs | per-record durability |
//! | [`MemOnly`] | hash map, persisted on snapshot | small or ephemeral data |
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                       KvStore                           │
//! │     get · set (empty value = delete) · snapshot         │
//! │            restore(version) · close                     │
//! ├───────────────┬──────────────────┬──────────────────────┤
//! │   LsmTree     │    HybridLog     │      AppendLog       │
//! │ memtable+WAL  │ ring + hash idx  │  hash idx + active   │
//! │ runs+sidecars │ LA-to-file map   │       run file       │
//! ├───────────────┴──────────────────┴──────────────────────┤
//! │  record codec · bloom · fence · ring · store lifecycle  │
//! ├─────────────────────────────────────────────────────────┤
//! │     replica: per-slot versioned snapshots (path or      │
//! │                     object store)                       │
//! └─────────────────────────────────────────────────────────┘
//! ```
//!
//! All engines map non-empty byte keys to byte values, recover their
//! state from the data directory on open, and refuse directories tagged
//! for another engine type. Merging and flushing run inline on the
//! calling thread; there is no background work and no locking.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use tierkv::{KvStore, LsmTree, LsmTreeConfig};
//!
//! let mut db = LsmTree::open("/tmp/my_db", LsmTreeConfig::default())?;
//!
//! db.set(b"hello", b"world")?;
//! assert_eq!(db.get(b"hello")?, b"world");
//!
//! db.delete(b"hello")?;
//! assert_eq!(db.get(b"hello")?, b"");
//!
//! db.close()?;
//! # Ok::<(), tierkv::StoreError>(())
//! ```
//!
//! ## Snapshots
//!
//! Attach a [`Replica`] to mirror sealed run files into a local directory
//! ([`PathReplica`]) or an object store ([`ObjectReplica`]). Each
//! snapshot is named by a global version; `restore(Some(v))` returns the
//! store to exactly the `v`-th snapshot.

pub mod appendlog;
pub mod bloom;
pub mod fence;
pub mod hybridlog;
pub mod lsmtree;
pub mod memonly;
pub mod record;
pub mod replica;
pub mod ring;
pub mod store;

pub use appendlog::{AppendLog, AppendLogConfig};
pub use hybridlog::{HashIndexKind, HybridLog, HybridLogConfig};
pub use lsmtree::{LsmTree, LsmTreeConfig};
pub use memonly::{MemOnly, MemOnlyConfig};
pub use replica::{
    MemoryObjectStore, ObjectReplica, ObjectStore, PathReplica, Replica, ReplicaError,
    expand_version,
};
pub use store::{EngineType, KvStore, RunRecord, StoreError};
