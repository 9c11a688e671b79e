//! Metadata tagging, validation, and run discovery.

use crate::store::{EngineType, StoreBase, StoreError};
use std::fs;
use tempfile::TempDir;

fn open(dir: &TempDir, engine: EngineType) -> Result<StoreBase, StoreError> {
    StoreBase::open(dir.path(), 255, 255, engine, None)
}

#[test]
fn fresh_directory_is_tagged() {
    let tmp = TempDir::new().unwrap();
    open(&tmp, EngineType::LsmTree).unwrap();

    let metadata = fs::read_to_string(tmp.path().join("metadata")).unwrap();
    let value: serde_json::Value = serde_json::from_str(&metadata).unwrap();
    assert_eq!(value["type"], "lsmtree");
}

#[test]
fn reopening_with_same_engine_succeeds() {
    let tmp = TempDir::new().unwrap();
    open(&tmp, EngineType::AppendLog).unwrap();
    open(&tmp, EngineType::AppendLog).unwrap();
}

#[test]
fn mismatched_engine_is_refused() {
    let tmp = TempDir::new().unwrap();
    open(&tmp, EngineType::LsmTree).unwrap();

    match open(&tmp, EngineType::HybridLog) {
        Err(StoreError::EngineTypeMismatch { expected, found }) => {
            assert_eq!(expected, EngineType::HybridLog);
            assert_eq!(found, "lsmtree");
        }
        other => panic!("expected EngineTypeMismatch, got {:?}", other.map(|_| ())),
    }
}

#[test]
fn corrupt_metadata_is_refused() {
    let tmp = TempDir::new().unwrap();
    fs::write(tmp.path().join("metadata"), "{ not json").unwrap();
    assert!(matches!(
        open(&tmp, EngineType::MemOnly),
        Err(StoreError::Metadata(_))
    ));
}

#[test]
fn key_and_value_validation() {
    let tmp = TempDir::new().unwrap();
    let base = StoreBase::open(tmp.path(), 4, 6, EngineType::MemOnly, None).unwrap();

    assert!(matches!(base.check_key(b""), Err(StoreError::EmptyKey)));
    assert!(base.check_key(b"abcd").is_ok());
    assert!(matches!(
        base.check_key(b"abcde"),
        Err(StoreError::KeyTooLong { len: 5, max: 4 })
    ));

    assert!(base.check_value(b"").is_ok());
    assert!(base.check_value(b"123456").is_ok());
    assert!(matches!(
        base.check_value(b"1234567"),
        Err(StoreError::ValueTooLong { len: 7, max: 6 })
    ));
}

#[test]
fn zero_limits_are_rejected() {
    let tmp = TempDir::new().unwrap();
    assert!(matches!(
        StoreBase::open(tmp.path(), 0, 255, EngineType::MemOnly, None),
        Err(StoreError::InvalidConfig(_))
    ));
}

#[test]
fn discovery_counts_runs_per_level() {
    let tmp = TempDir::new().unwrap();
    let base = open(&tmp, EngineType::AppendLog).unwrap();

    assert_eq!(base.discover_levels().unwrap(), Vec::<usize>::new());

    for name in ["L0.0.run", "L0.1.run", "L2.0.run"] {
        fs::write(tmp.path().join(name), b"").unwrap();
    }
    // Sidecars and foreign files are not runs.
    for name in ["L0.0.filter", "L0.0.pointers", "wal", "notes.txt"] {
        fs::write(tmp.path().join(name), b"").unwrap();
    }

    assert_eq!(base.discover_levels().unwrap(), vec![2, 0, 1]);
}

#[test]
fn path_helpers() {
    let tmp = TempDir::new().unwrap();
    let base = open(&tmp, EngineType::LsmTree).unwrap();
    assert!(base.run_path(1, 2).ends_with("L1.2.run"));
    assert!(base.filter_path(1, 2).ends_with("L1.2.filter"));
    assert!(base.pointers_path(1, 2).ends_with("L1.2.pointers"));
}
