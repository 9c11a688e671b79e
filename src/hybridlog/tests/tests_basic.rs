//! Reads across the memory and disk regions, in-place updates, and
//! tombstone semantics.

use crate::hybridlog::tests::helpers::*;
use crate::hybridlog::{HashIndexKind, HybridLog, HybridLogConfig};
use crate::store::{KvStore, StoreError};
use tempfile::TempDir;

#[test]
fn reads_span_memory_and_disk() {
    let tmp = TempDir::new().unwrap();
    let mut log = open(tmp.path(), tiny_config());

    // Four writes through a three-slot ring force a flush: the first
    // keys end up on disk, the rest stay in memory.
    log.set(b"asdf", b"\x00\x01\x00\x00").unwrap();
    log.set(b"b", b"\x00\x00\x02\x00").unwrap();
    log.set(b"d", b"3\x002\x00").unwrap();
    log.set(b"e", b"55").unwrap();

    assert_eq!(log.get(b"asdf").unwrap(), b"\x00\x01\x00\x00");
    assert_eq!(log.get(b"b").unwrap(), b"\x00\x00\x02\x00");
    assert_eq!(log.get(b"c").unwrap(), b"");
    assert_eq!(log.get(b"d").unwrap(), b"3\x002\x00");
    assert_eq!(log.get(b"e").unwrap(), b"55");

    log.close().unwrap();
}

#[test]
fn in_place_update_in_mutable_region() {
    let tmp = TempDir::new().unwrap();
    let mut log = open(tmp.path(), small_config());

    log.set(b"hot", b"v1").unwrap();
    log.set(b"hot", b"v2").unwrap();
    log.set(b"hot", b"v3").unwrap();
    assert_eq!(log.get(b"hot").unwrap(), b"v3");
}

#[test]
fn update_of_flushed_key_appends_fresh_record() {
    let tmp = TempDir::new().unwrap();
    let mut log = open(tmp.path(), tiny_config());

    log.set(b"k1", b"old").unwrap();
    log.set(b"k2", b"x").unwrap();
    log.set(b"k3", b"y").unwrap();
    // k1 is on disk by now; the update must append, not touch the run.
    log.set(b"k1", b"new").unwrap();
    assert_eq!(log.get(b"k1").unwrap(), b"new");
}

#[test]
fn tombstone_reads_empty() {
    let tmp = TempDir::new().unwrap();
    let mut log = open(tmp.path(), small_config());

    log.set(b"gone", b"here").unwrap();
    log.delete(b"gone").unwrap();
    assert_eq!(log.get(b"gone").unwrap(), b"");

    // Also once the tombstone itself has been flushed.
    for i in 0..40u8 {
        log.set(&[b'f', i], b"fill").unwrap();
    }
    assert_eq!(log.get(b"gone").unwrap(), b"");
}

#[test]
fn offsets_remain_ordered() {
    let tmp = TempDir::new().unwrap();
    let mut log = open(tmp.path(), small_config());

    for i in 0..100u8 {
        log.set(&[b'k', i % 7], &[i]).unwrap();
        let (head, ro, tail) = log.offsets();
        assert!(head <= ro, "head {head} > ro {ro}");
        assert!(ro <= tail, "ro {ro} > tail {tail}");
        assert!(tail - head <= 30, "window exceeds the ring capacity");
    }
}

#[test]
fn native_index_falls_back_to_dict() {
    let tmp = TempDir::new().unwrap();
    let mut log = HybridLog::open(
        tmp.path(),
        HybridLogConfig {
            hash_index: HashIndexKind::Native,
            ..small_config()
        },
    )
    .unwrap();
    log.set(b"k", b"v").unwrap();
    assert_eq!(log.get(b"k").unwrap(), b"v");
}

#[test]
fn invalid_configs_are_rejected() {
    let tmp = TempDir::new().unwrap();
    for config in [
        HybridLogConfig {
            ro_lag_interval: 0,
            ..Default::default()
        },
        HybridLogConfig {
            flush_interval: 0,
            ..Default::default()
        },
        HybridLogConfig {
            mem_segment_len: 10,
            ro_lag_interval: 8,
            flush_interval: 8,
            ..Default::default()
        },
    ] {
        assert!(matches!(
            HybridLog::open(tmp.path(), config),
            Err(StoreError::InvalidConfig(_))
        ));
    }
}

#[test]
fn oversize_writes_are_rejected() {
    let tmp = TempDir::new().unwrap();
    let mut log = open(tmp.path(), small_config());
    let long = vec![0u8; 256];
    assert!(matches!(
        log.set(&long, b"v"),
        Err(StoreError::KeyTooLong { .. })
    ));
    assert!(matches!(log.get(b""), Err(StoreError::EmptyKey)));
}
