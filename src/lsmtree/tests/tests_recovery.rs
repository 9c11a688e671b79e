//! Durability across close and reopen: WAL replay, run reload, torn
//! trailing writes.

use crate::lsmtree::tests::helpers::*;
use crate::store::KvStore;
use std::fs::OpenOptions;
use std::io::Write;
use tempfile::TempDir;

#[test]
fn memtable_survives_via_wal() {
    let tmp = TempDir::new().unwrap();

    {
        let mut db = open(tmp.path(), default_config());
        db.set(b"a", b"1").unwrap();
        db.set(b"b", b"2").unwrap();
        db.set(b"c", b"3").unwrap();
        db.close().unwrap();
    }

    // Nothing was flushed; the WAL alone carries the state.
    assert!(tmp.path().join("wal").exists());
    assert!(!tmp.path().join("L0.0.run").exists());

    let mut db = open(tmp.path(), default_config());
    assert_eq!(db.get(b"a").unwrap(), b"1");
    assert_eq!(db.get(b"b").unwrap(), b"2");
    assert_eq!(db.get(b"c").unwrap(), b"3");
    db.close().unwrap();
}

#[test]
fn flushed_runs_survive_reopen() {
    let tmp = TempDir::new().unwrap();

    {
        let mut db = open(tmp.path(), granular_config());
        for i in 0..30u8 {
            db.set(&[b'k', i], &[b'v', i, i]).unwrap();
        }
        db.close().unwrap();
    }

    let mut db = open(tmp.path(), granular_config());
    for i in 0..30u8 {
        assert_eq!(db.get(&[b'k', i]).unwrap(), &[b'v', i, i]);
    }
}

#[test]
fn overwrites_and_deletes_survive_reopen() {
    let tmp = TempDir::new().unwrap();

    {
        let mut db = open(tmp.path(), granular_config());
        db.set(b"keep", b"old").unwrap();
        db.set(b"drop", b"soon").unwrap();
        db.snapshot().unwrap();
        db.set(b"keep", b"new").unwrap();
        db.delete(b"drop").unwrap();
        db.close().unwrap();
    }

    let mut db = open(tmp.path(), granular_config());
    assert_eq!(db.get(b"keep").unwrap(), b"new");
    assert_eq!(db.get(b"drop").unwrap(), b"");
}

#[test]
fn torn_trailing_wal_record_is_dropped() {
    let tmp = TempDir::new().unwrap();

    {
        let mut db = open(tmp.path(), default_config());
        db.set(b"good", b"value").unwrap();
        db.close().unwrap();
    }

    // Simulate a crash mid-append: a record header with half a payload.
    let mut wal = OpenOptions::new()
        .append(true)
        .open(tmp.path().join("wal"))
        .unwrap();
    wal.write_all(b"\x04to").unwrap();
    drop(wal);

    let mut db = open(tmp.path(), default_config());
    assert_eq!(db.get(b"good").unwrap(), b"value");
    // The torn key never materializes.
    assert_eq!(db.get(b"torn").unwrap(), b"");
    db.close().unwrap();
}

#[test]
fn wal_truncated_after_flush() {
    let tmp = TempDir::new().unwrap();
    let mut db = open(tmp.path(), default_config());

    db.set(b"k", b"v").unwrap();
    assert!(std::fs::metadata(tmp.path().join("wal")).unwrap().len() > 0);

    db.snapshot().unwrap();
    assert_eq!(std::fs::metadata(tmp.path().join("wal")).unwrap().len(), 0);
}
