//! Merging sealed runs: liveness filtering, cascades, and the single-run
//! degenerate configuration.

use crate::appendlog::tests::helpers::*;
use crate::appendlog::AppendLogConfig;
use crate::record::RecordCodec;
use crate::store::KvStore;
use std::fs;
use tempfile::TempDir;

fn run_count(dir: &std::path::Path, level: usize) -> usize {
    fs::read_dir(dir)
        .unwrap()
        .filter_map(|e| e.unwrap().file_name().into_string().ok())
        .filter(|n| n.starts_with(&format!("L{level}.")) && n.ends_with(".run"))
        .count()
}

#[test]
fn merge_drops_overwritten_and_deleted_records() {
    let tmp = TempDir::new().unwrap();
    let mut log = open(tmp.path(), tiny_config());

    // Churn a small key set hard enough to push through several merges,
    // deleting one key for good along the way.
    for round in 0..20u8 {
        for k in 0..4u8 {
            log.set(&[b'k', k], &[b'v', round, k]).unwrap();
        }
        log.delete(b"k\x00").unwrap();
    }

    assert_eq!(log.get(b"k\x00").unwrap(), b"");
    for k in 1..4u8 {
        assert_eq!(log.get(&[b'k', k]).unwrap(), &[b'v', 19, k]);
    }

    // Deep runs hold at most one record per live key: merged output is
    // fully deduplicated.
    let codec = RecordCodec::new(255, 255);
    for entry in fs::read_dir(tmp.path()).unwrap() {
        let path = entry.unwrap().path();
        let name = path.file_name().unwrap().to_str().unwrap().to_string();
        if name.starts_with("L0.") || !name.ends_with(".run") {
            continue;
        }
        let mut seen = std::collections::HashSet::new();
        let mut fd = fs::File::open(&path).unwrap();
        while let Some((key, _)) = codec.read_record(&mut fd).unwrap() {
            assert!(seen.insert(key), "duplicate key inside merged run {name}");
        }
    }
}

#[test]
fn level_zero_respects_the_cap() {
    let tmp = TempDir::new().unwrap();
    let mut log = open(tmp.path(), tiny_config());

    for i in 0..60u8 {
        log.set(&[b'k', i], b"01234567").unwrap();
        // Sealed runs stay below the cap; the active file makes it at
        // most max_runs_per_level files total.
        assert!(
            run_count(tmp.path(), 0) <= 3,
            "too many level-0 files after write {i}"
        );
    }
}

#[test]
fn single_run_per_level_config_still_converges() {
    let tmp = TempDir::new().unwrap();
    let mut log = open(
        tmp.path(),
        AppendLogConfig {
            max_runs_per_level: 1,
            threshold: 8,
            ..Default::default()
        },
    );

    for i in 0..40u8 {
        log.set(&[b'k', i % 6], &[b'v', i]).unwrap();
    }
    for k in 0..6u8 {
        // Last write for key k is the largest i with i % 6 == k.
        let last = (0..40u8).filter(|i| i % 6 == k).max().unwrap();
        assert_eq!(log.get(&[b'k', k]).unwrap(), &[b'v', last]);
    }
    log.close().unwrap();
}

#[test]
fn merged_data_survives_reopen() {
    let tmp = TempDir::new().unwrap();

    {
        let mut log = open(tmp.path(), tiny_config());
        for i in 0..50u8 {
            log.set(&[b'k', i % 8], &[b'v', i]).unwrap();
        }
        log.close().unwrap();
    }

    let mut log = open(tmp.path(), tiny_config());
    for k in 0..8u8 {
        let last = (0..50u8).filter(|i| i % 8 == k).max().unwrap();
        assert_eq!(log.get(&[b'k', k]).unwrap(), &[b'v', last], "key {k}");
    }
}
